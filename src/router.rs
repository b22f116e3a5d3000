//! Maps a parsed request onto a response or a CGI run.

use std::io;
use std::path::{Path, PathBuf};

use crate::cgi::CgiRequest;
use crate::config::ListenerConfig;
use crate::encoding::{make_safe_url, url_decode};
use crate::request::Request;
use crate::response::{Listing, Response, StatusCode};

const INDEX_NAME: &str = "index.html";
const HOME_REDIRECT: &str = "./pages/index.html";
const EXTERNAL_REDIRECT: &str = "http://www.google.com/";

/// What a request turned into.
#[derive(Debug)]
pub enum Routed {
    Response(Response),
    /// Needs a script run; the response is the script's output.
    Cgi(CgiRequest),
}

/// Dispatch on the request method.
pub fn route(config: &ListenerConfig, request: &Request<'_>) -> Routed {
    match request.method() {
        "GET" => Routed::Response(get(config, request)),
        "POST" => post(config, request),
        "DELETE" => Routed::Response(Response::delete_stub()),
        _ => Routed::Response(Response::error(config, StatusCode::NotImplemented)),
    }
}

/// Built-in shortcuts, checked before any filesystem lookup.
fn shortcut(path: &str) -> Option<Response> {
    match path {
        "/" => Some(Response::redirect(HOME_REDIRECT)),
        "/redirect" => Some(Response::redirect(EXTERNAL_REDIRECT)),
        _ => None,
    }
}

fn get(config: &ListenerConfig, request: &Request<'_>) -> Response {
    let path = match request.path() {
        Some(path) => path,
        None => return Response::error(config, StatusCode::BadRequest),
    };
    if let Some(response) = shortcut(path) {
        return response;
    }
    if let Some(target) = config.redirect(path) {
        return Response::redirect(target);
    }

    let url = match make_safe_url(&url_decode(path)) {
        Some(url) => url,
        None => return Response::error(config, StatusCode::BadRequest),
    };
    let target = format!("{}{}", config.root(), url);

    match std::fs::metadata(&target) {
        Ok(metadata) if metadata.is_dir() => directory(config, &target, &url),
        Ok(metadata) if metadata.is_file() => serve_file(config, Path::new(&target)),
        Ok(_) => Response::error(config, StatusCode::Forbidden),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            Response::error(config, StatusCode::Forbidden)
        }
        Err(_) => Response::error(config, StatusCode::NotFound),
    }
}

/// Serve the directory's index file, a generated listing, or 403.
fn directory(config: &ListenerConfig, target: &str, url: &str) -> Response {
    let index = if target.ends_with('/') {
        format!("{}{}", target, INDEX_NAME)
    } else {
        format!("{}/{}", target, INDEX_NAME)
    };
    if Path::new(&index).is_file() {
        return serve_file(config, Path::new(&index));
    }
    if !config.autoindex() {
        return Response::error(config, StatusCode::Forbidden);
    }
    match Listing::read(Path::new(target), url) {
        Ok(listing) => Response::new(StatusCode::Ok, listing.to_string().as_bytes()),
        Err(e) => {
            eprintln!("warning: failed to list directory {}: {}", target, e);
            Response::error(config, StatusCode::InternalServerError)
        }
    }
}

fn serve_file(config: &ListenerConfig, path: &Path) -> Response {
    match std::fs::read(path) {
        Ok(body) => Response::new(StatusCode::Ok, &body),
        Err(e) => {
            eprintln!("warning: failed to read {}: {}", path.display(), e);
            Response::error(config, StatusCode::InternalServerError)
        }
    }
}

/// POST always goes to the listener's upload script.
fn post(config: &ListenerConfig, request: &Request<'_>) -> Routed {
    let mut cgi = CgiRequest::new(config.cgi_script(), PathBuf::from(config.root()));
    cgi.push_env("REQUEST_METHOD", "POST");
    cgi.push_env_from_header(request, "Content-Type", "CONTENT_TYPE");
    cgi.push_env("CONTENT_LENGTH", &request.body().len().to_string());
    cgi.push_env("QUERY_STRING", request.query());
    cgi.push_env("PATH_INFO", request.path().unwrap_or("/"));
    cgi.push_env("SERVER_PROTOCOL", "HTTP/1.1");
    cgi.push_env("GATEWAY_INTERFACE", "CGI/1.1");
    cgi.push_env("SERVER_NAME", &config.ip().to_string());
    cgi.push_env("SERVER_PORT", &config.port().to_string());
    cgi.set_body(request.body());
    Routed::Cgi(cgi)
}
