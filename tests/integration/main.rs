//! End-to-end tests against an in-process wire-protocol server.

mod cancellation;
mod pooling;
mod server;
mod sessions;

use hermod_mysql::config::ConnectOptions;

use server::FakeServer;

pub fn connect_options(server: &FakeServer) -> ConnectOptions {
    ConnectOptions::new(server.host(), "app")
        .port(server.port())
        .password("secret")
}
