pub mod builder;
pub mod capture;
pub mod config;
pub mod invoke;
pub mod launcher;
pub mod protocol;
pub mod proxy;
pub mod responder;
pub mod rights;
pub mod runner;
pub mod sandbox;
pub mod server;
