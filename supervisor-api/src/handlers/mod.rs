mod app;
mod services;

pub use app::add_routes;
