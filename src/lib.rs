//! A small HTTP/1.1 origin server: static files, directory listings and CGI uploads, driven by a
//! single-threaded `poll(2)` loop.

pub mod cgi;
pub mod config;
pub mod connection;
pub mod encoding;
pub mod listener;
pub mod log;
pub mod reactor;
pub mod registry;
pub mod request;
pub mod response;
pub mod router;
pub mod stats;
