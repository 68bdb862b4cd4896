use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::{event, Level};

use crate::{FileCache, Method, Request, Response, Service};

/// Serves files below a document root through the worker's file cache.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index: String,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: "index.html".to_string(),
        }
    }

    /// Set the file served for directory paths, `index.html` by default.
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a request path onto the file system, `None` if it would escape the root.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        if path.contains('\\') || path.contains('\0') {
            return None;
        }

        let mut resolved = self.root.clone();
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return None,
                segment => resolved.push(segment),
            }
        }

        if path.ends_with('/') || resolved.is_dir() {
            resolved.push(&self.index);
        }

        Some(resolved)
    }
}

impl Service for StaticFiles {
    fn handle(&self, request: &Request, files: &mut FileCache) -> Response {
        if !matches!(request.method, Method::Get | Method::Head) {
            let mut response = Response::with_body(405, "Method Not Allowed");
            response.headers.set("Allow", "GET, HEAD");
            return response;
        }

        let Some(path) = self.resolve(request.path()) else {
            return Response::with_body(400, "Bad Request");
        };

        let entry = match files.open(&path) {
            Ok(entry) => entry,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Response::with_body(404, "Not Found");
            }
            Err(error) => {
                event!(Level::WARN, ?error, path = ?path, "failed to read file");
                return Response::with_body(500, "Internal Server Error");
            }
        };

        let mut response = if request.method == Method::Head {
            let mut response = Response::new(200);
            response
                .headers
                .set("Content-Length", entry.bytes().len().to_string());
            response
        } else {
            Response::cached(200, path)
        };

        response.headers.set("Content-Type", entry.content_type());
        if let Some(modified) = entry.modified() {
            response
                .headers
                .set("Last-Modified", httpdate::fmt_http_date(modified));
        }

        response
    }
}
