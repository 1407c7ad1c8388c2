use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use request_consumer::config::Config;
use request_consumer::contracts::{Headers, ProcessingOutcome, Request};
use request_consumer::messaging::{
    ConsumerError, LapinBroker, LapinRepublisher, ProcessingError, ProcessingTask, RequestConsumer,
    RequestProcessor,
};
use request_consumer::metrics::{Metrics, server::start_metrics_server};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Echoes requests back into the log.
///
/// Commands `discard` and `retry` exercise the discard and republish paths,
/// `crash` reports an unclassified failure. A retried request comes back as `say`.
struct EchoProcessor;

impl RequestProcessor for EchoProcessor {
    fn process(&self, body: String, headers: Headers) -> Result<ProcessingTask, ProcessingError> {
        Ok(async move {
            let request = match Request::from_body(&body) {
                Ok(request) => request,
                Err(e) => return ProcessingOutcome::discard(format!("Invalid request body: {}", e)),
            };

            match request.command.as_deref() {
                Some("discard") => ProcessingOutcome::discard("Discard requested by command"),
                Some("retry") => {
                    let mut retry = request;
                    retry.command = Some("say".to_string());
                    ProcessingOutcome::republish(retry, headers)
                }
                Some("crash") => ProcessingOutcome::failure("Crash requested by command"),
                command => {
                    info!(
                        request_id = %request.id,
                        command = command.unwrap_or("<none>"),
                        parameters = %serde_json::Value::Object(request.parameters.clone()),
                        "Echoing request"
                    );
                    ProcessingOutcome::Success
                }
            }
        }
        .boxed())
    }
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        queue = %config.consumer.queue_name,
        "Request consumer worker starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!(error = %e, "Failed to create metrics");
            std::process::exit(1);
        }
    };

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let amqp_url = match config.connection.amqp_url() {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "Invalid broker address");
            std::process::exit(1);
        }
    };
    let mut consumer = match RequestConsumer::builder(config.connection.clone(), config.consumer.clone())
        .amqp_url(amqp_url.clone())
        .broker(Arc::new(LapinBroker::new(format!(
            "{}-consumer",
            config.service_name
        ))))
        .republisher(Arc::new(LapinRepublisher::new(config.connection.clone(), amqp_url)))
        .processor(Arc::new(EchoProcessor))
        .metrics(metrics)
        .build()
    {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(error = %e, "Failed to build consumer");
            std::process::exit(1);
        }
    };

    let handle = consumer.handle();
    let mut consumer_task = tokio::spawn(async move { consumer.run().await });

    let (exit_code, stopping) = tokio::select! {
        result = &mut consumer_task => (report(result), false),
        _ = tokio::signal::ctrl_c() => {
            warn!("Shutdown signal received, stopping consumer");
            (0, true)
        }
        _ = handle.wait_for_panic() => {
            error!("Consumer raised its panic flag, shutting down");
            (1, true)
        }
    };

    if stopping {
        handle.stop();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, consumer_task).await.is_err() {
            warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Consumer shutdown timeout");
        }
    }

    info!(exit_code, "Request consumer worker stopped");
    std::process::exit(exit_code);
}

fn report(result: Result<Result<(), ConsumerError>, JoinError>) -> i32 {
    match result {
        Ok(Ok(())) => {
            warn!("Consumer stopped on its own");
            0
        }
        Ok(Err(e)) => {
            error!(error = %e, "Consumer failed");
            1
        }
        Err(e) => {
            error!(error = %e, "Consumer task aborted");
            1
        }
    }
}

fn setup_logging(rust_log: &str) {
    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        let thread = std::thread::current();

        error!(
            panic_message = message,
            location = %location,
            thread = thread.name().unwrap_or("unnamed"),
            "Thread panicked"
        );
    }));
}
