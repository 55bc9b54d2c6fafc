use crate::connection::ws_index;
use crate::handlers::admin::configure_admin_handlers;
use actix_web::web;

mod admin;

/// Drawing protocol endpoint.
pub fn drawing(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/ws/").route(web::get().to(ws_index)));
}

pub fn admin(cfg: &mut web::ServiceConfig) {
    configure_admin_handlers(cfg);
}

pub fn root(cfg: &mut web::ServiceConfig) {
    drawing(cfg);
    admin(cfg);
}
