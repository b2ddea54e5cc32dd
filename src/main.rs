use airunner::{
    api, config, logging, pipeline::select_device, summarization::SummarizationService,
    translation::TranslationService,
};
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    config::init_config();
    let config = config::get_config();
    logging::init_tracing(&config.log_file);
    tracing::info!(
        config_path = %config.config_path.display(),
        summarizers = config.summary.len(),
        auth = config.auth.is_some(),
        "Configuration loaded"
    );

    let device =
        select_device(config.device).expect("Failed to initialize compute device");
    let translator = TranslationService::from_config(&config.translation, &device);
    let summarizer = SummarizationService::from_config(&config.summary, &device);
    let app = api::create_router(
        Arc::new(translator),
        Arc::new(summarizer),
        config.auth.clone(),
    );

    let (listener, port) = bind_listener(config.listen_ports())
        .await
        .expect("Failed to bind listener");
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await.expect("Server error");
}

/// Bind the first free port of `ports`; ports already in use are skipped.
async fn bind_listener(ports: RangeInclusive<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    let (first, last) = (*ports.start(), *ports.end());
    for port in ports {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("No available port found in range {first}-{last}"),
    ))
}
