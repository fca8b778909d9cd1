use riptide::{download, TorrentConfig};

#[tokio::main]
async fn main() {

    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let path = std::env::args().nth(1).expect("usage: riptide <file.torrent>");
    let handle = download(&path, TorrentConfig::default())
        .map_err(|e| tracing::error!("{}", e))
        .unwrap();

    if let Some(join) = handle.join {
        match join.await.expect("torrent task panicked") {
            Ok(status) => tracing::info!("torrent finished: {:?}", status),
            Err(e) => tracing::error!("{}", e),
        }
    }
}
