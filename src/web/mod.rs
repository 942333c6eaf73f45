pub mod poll_ws;
pub mod votes;

/// Configures the web app by adding services from each web file.
///
/// @see https://docs.rs/actix-web/4.0.1/actix_web/struct.App.html#method.configure
pub fn configure(conf: &mut actix_web::web::ServiceConfig) {
    // Descending order. Route resolution will stop at the first match.
    poll_ws::configure(conf);
    votes::configure(conf);
}
