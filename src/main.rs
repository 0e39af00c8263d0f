use keysignup::config::Configuration;

#[tokio::main]
async fn main() {
    // config is read before the subscriber exists, log its warnings locally.
    let config = keysignup::telemetry::bootstrap(|| Configuration::default().from_env().read());

    if let Err(err) = keysignup::telemetry::init(config.otlp_endpoint.as_deref()) {
        eprintln!("cannot initialize logging: {err}");
    }

    tracing::info!(
        config = %config.file().display(),
        host = %config.redis_host,
        port = config.redis_port,
        channel = %config.channel,
        "starting keysignup"
    );

    let consumer = match keysignup::initialize(&config).await {
        Ok(consumer) => consumer,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            std::process::exit(1);
        },
    };

    consumer.run_until(shutdown_signal()).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
