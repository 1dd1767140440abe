// web-server/src/api/mod.rs
pub mod auth;

pub fn configure(cfg: &mut actix_web::web::ServiceConfig) {
    cfg.service(
        actix_web::web::scope("/api/auth")
            .service(auth::login)
            .service(auth::callback)
            .service(auth::logout)
            .service(auth::refresh)
            .service(auth::session_info)
    );
}
