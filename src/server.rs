//! Static development server for the output directory.

use std::net::SocketAddr;
use std::thread;

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;

/// Serve `dir` over HTTP on a background thread.
pub fn start(dir: Utf8PathBuf, port: u16) -> thread::JoinHandle<Result<(), anyhow::Error>> {
    let url = style(format!("http://localhost:{port}/")).yellow();
    eprintln!("Starting a HTTP server on {url}");

    thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(dir, port))
    })
}

async fn serve(dir: Utf8PathBuf, port: u16) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    let router = Router::new()
        // path to the output directory with the built project
        .fallback_service(ServeDir::new(dir));

    axum::serve(address, router).await?;

    Ok(())
}
