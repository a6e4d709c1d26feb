use std::process::ExitCode;
use std::sync::Arc;

use sifend::config::Config;
use sifend::handlers::Dispatcher;
use sifend::log::Logger;
use sifend::queue::Broker;
use sifend::soap::{HttpTransport, SifenClient, SifenUrls};
use sifend::store::SqlStore;
use sifend::worker::Worker;
use tracing::{error, info};

fn main() -> ExitCode {
    // Initialize the logger in fallback mode.
    let logger = Logger::launch();

    // Set up the command-line interface.
    let cmd = clap::Command::new("sifend")
        .version(clap::crate_version!())
        .about("SIFEN document lifecycle worker")
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );
    let matches = cmd.get_matches();

    // Construct the configuration.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("sifend couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("check_config") {
        return ExitCode::SUCCESS;
    }

    // Activate the configured logging setup.
    if let Err(error) = logger.apply(&config.log_level) {
        eprintln!("sifend couldn't set up logging: {error}");
        return ExitCode::FAILURE;
    }

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Couldn't start Tokio: {error}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    // Connect the shared resources: one store pool, one broker
    // connection.  The broker connect also declares the queue topology.
    let store = match SqlStore::connect(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(error) => {
            error!("Failed to reach the document store: {error}");
            return ExitCode::FAILURE;
        }
    };
    let broker = match Broker::connect(
        &config.amqp_url,
        config.delay_ttl_ms,
        config.prefetch_count,
    )
    .await
    {
        Ok(broker) => Arc::new(broker),
        Err(error) => {
            error!("Failed to reach the broker: {error}");
            return ExitCode::FAILURE;
        }
    };

    let sifen = SifenClient::new(
        Arc::new(HttpTransport),
        SifenUrls {
            submit_batch: config.url_recebe_lote.clone(),
            query_batch: config.url_consulta_lote.clone(),
            submit_event: config.url_evento.clone(),
        },
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        sifen,
        broker.clone(),
        config.url_qr.clone(),
        config.max_poll_attempts,
    );
    let worker = Worker::new(broker.clone(), dispatcher);

    let result = tokio::select! {
        res = worker.run() => match res {
            Ok(()) => {
                info!("Broker channel closed; exiting");
                ExitCode::SUCCESS
            }
            Err(error) => {
                error!("Worker failed: {error}");
                ExitCode::FAILURE
            }
        },

        // Watch for SIGINT and SIGTERM.
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received");
            ExitCode::SUCCESS
        }
    };

    // Any in-flight delivery stays unacked and will be redelivered.
    broker.close().await;
    store.close().await;
    result
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}
