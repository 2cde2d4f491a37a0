use clap::Parser;
use kafka_courier::kafka::{DeliveryResult, Record};
use kafka_courier::{Config, ProducerClient, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "kafka-courier")]
#[command(about = "Publish a JSON message to Kafka and report its delivery", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(short, long, value_name = "JSON", help = "Message payload (defaults to a demo record)")]
    message: Option<String>,

    #[arg(short, long, help = "Record key")]
    key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting kafka-courier");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        kafka_brokers = ?config.brokers,
        kafka_topic = %config.topic,
        security_protocol = config.security_protocol.as_str(),
        sasl_mechanism = config.sasl_mechanism.map(|m| m.as_str()),
        "Configuration summary"
    );

    let payload = match &args.message {
        Some(message) => {
            // Reject malformed input before it reaches the broker
            serde_json::from_str::<serde_json::Value>(message)?;
            message.clone().into_bytes()
        }
        None => serde_json::to_vec(&serde_json::json!({
            "id": 1,
            "name": "test",
            "timestamp": chrono::Utc::now().timestamp(),
        }))?,
    };

    let payload_len = payload.len();
    let mut record = Record::new(config.topic.clone(), payload);
    if let Some(key) = &args.key {
        record = record.with_key(key.clone());
    }

    let flush_timeout = config.producer.flush_timeout();
    let producer = ProducerClient::connect(config).await?;

    let delivery = producer.send(record).await?;
    producer.flush(flush_timeout).await?;

    let report = delivery.await;
    log_delivery(&report, payload_len);

    info!(stats = ?producer.stats(), "Producer statistics");
    producer.close().await?;

    report.map(|_| ())
}

fn log_delivery(report: &DeliveryResult, bytes: usize) {
    match report {
        Ok(metadata) => info!(
            topic = %metadata.topic,
            partition = metadata.partition,
            offset = metadata.offset,
            bytes,
            "Message delivered"
        ),
        Err(e) => error!(bytes, "Message delivery failed: {}", e),
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("kafka_courier=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("kafka_courier=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_courier::kafka::RecordMetadata;
    use kafka_courier::Error;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(report: &DeliveryResult, bytes: usize) -> String {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || log_delivery(report, bytes));

        let output = logs.0.lock().unwrap().clone();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_delivery_report_includes_byte_count() {
        let report = Ok(RecordMetadata {
            topic: "events".to_string(),
            partition: 2,
            offset: 41,
            timestamp_ms: 0,
        });

        let output = capture(&report, 52);
        assert!(output.contains("Message delivered"));
        assert!(output.contains("bytes=52"));
        assert!(output.contains("offset=41"));
    }

    #[test]
    fn test_failed_delivery_is_logged_as_error() {
        let output = capture(&Err(Error::ClientClosed), 52);
        assert!(output.contains("ERROR"));
        assert!(output.contains("Message delivery failed"));
    }
}
