//! Shared fixtures for integration tests
#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shell script that plays frpc: answers `--version`, otherwise prints its
/// config and idles until killed
pub const FAKE_FRPC: &[u8] = b"#!/bin/sh
if [ \"$1\" = \"--version\" ]; then
  echo 0.53.0
  exit 0
fi
echo \"frpc started with $2\"
cat \"$2\"
exec sleep 60
";

pub fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Release descriptor JSON for `tag` with the given `(asset name, url)` pairs
pub fn release_json(tag: &str, assets: &[(&str, String)]) -> Vec<u8> {
    let assets: Vec<serde_json::Value> = assets
        .iter()
        .map(|(name, url)| {
            serde_json::json!({
                "name": name,
                "size": 0,
                "browser_download_url": url,
            })
        })
        .collect();
    serde_json::json!({ "tag_name": tag, "name": tag, "assets": assets })
        .to_string()
        .into_bytes()
}

/// Canned `(status, body)` per request path
pub type Routes = HashMap<String, (StatusCode, Vec<u8>)>;

/// Serve canned responses on an ephemeral local port. `build` receives the
/// bound address so bodies can point back at the server. Unknown paths get 404.
pub async fn start_release_server<F>(build: F) -> SocketAddr
where
    F: FnOnce(SocketAddr) -> Routes,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(build(addr));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let routes = Arc::clone(&routes);
                    async move {
                        let (status, body) = routes
                            .get(req.uri().path())
                            .cloned()
                            .unwrap_or((StatusCode::NOT_FOUND, b"not found".to_vec()));
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}
