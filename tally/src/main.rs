//! tally - produce a known number of messages, consume them concurrently and
//! reconcile what was delivered from the offsets observed on each partition.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use anyhow::{anyhow, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tally::args::{Args, Backend};
use tally::harness::{Harness, HarnessConfig, RunReport};
use tally::kafka_client::KafkaClient;
use tally::shutdown::{spawn_interrupt_escalation, Shutdown};
use tally::transport::kafka::DEFAULT_STREAM_BUFFER;
use tally::transport::{
    KafkaPublisher, KafkaStream, MemoryBroker, MemoryCoordinator, MessageStream, NodePublisher,
    Publisher,
};
use tally::utils::format_bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit status for invalid configuration (EX_USAGE)
const EXIT_CONFIG: u8 = 64;

/// Root path for nodes created by the coordination backend
const NODE_ROOT: &str = "/tally";

/// Initialize tracing subscriber for structured logging
fn setup_logging(quiet: bool, verbose: bool) {
    let default_level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_level)),
        )
        .init();
}

fn print_startup_info(args: &Args, config: &HarnessConfig) {
    info!("Starting tally - offset reconciliation harness");
    info!(
        "Backend: {:?}, broker: {}, topic: '{}', start offset: {:?}",
        args.backend, args.broker, config.topic, args.offset
    );
    info!(
        "Messages: {}, workers: {}, interval: {:?}, grace: {:?}, message size: {:?}",
        config.messages, config.workers, config.interval, config.grace, config.message_size
    );
    if let Some(timeout) = config.idle_timeout {
        info!("Consumer idle timeout: {:?}", timeout);
    }
    if config.track_gaps {
        info!("Gap audit: ENABLED - every offset seen is kept per partition");
    }
}

/// Opens the publisher and an already-subscribed stream for the chosen backend
async fn connect_backend(args: &Args) -> Result<(Arc<dyn Publisher>, Arc<dyn MessageStream>)> {
    match args.backend {
        Backend::Kafka => {
            let producer_client = Arc::new(
                KafkaClient::connect(&args.broker)
                    .await
                    .map_err(|e| anyhow!("Failed to connect producer client: {}", e))?,
            );
            // Separate connection so fetches never queue behind produces
            let consumer_client = Arc::new(
                KafkaClient::connect_with_versions(
                    &args.broker,
                    producer_client.api_versions.clone(),
                )
                .await
                .map_err(|e| anyhow!("Failed to connect consumer client: {}", e))?,
            );

            let stream =
                KafkaStream::subscribe(consumer_client, &args.topic, args.offset, DEFAULT_STREAM_BUFFER)
                    .await?;
            let partitions = producer_client.partition_count(&args.topic).await?;
            let publisher = KafkaPublisher::new(producer_client, partitions);
            Ok((Arc::new(publisher), Arc::new(stream)))
        }
        Backend::Memory => {
            let broker = MemoryBroker::new(args.partitions);
            let stream = broker.subscribe(&args.topic, args.offset);
            Ok((Arc::new(broker.publisher()), Arc::new(stream)))
        }
        Backend::Coordination => {
            let coordinator = MemoryCoordinator::new();
            let stream = coordinator.watch();
            let publisher = NodePublisher::new(coordinator, NODE_ROOT);
            Ok((Arc::new(publisher), Arc::new(stream)))
        }
    }
}

/// Feeds Ctrl-C (and SIGTERM/SIGHUP on unix) into the interrupt escalation
///
/// The first signal stops production, a second one shuts down immediately.
fn spawn_signal_handlers(interrupt: CancellationToken, shutdown: Shutdown) {
    let (events, rx) = mpsc::channel(4);
    spawn_interrupt_escalation(rx, interrupt, shutdown);

    #[cfg(unix)]
    {
        spawn_unix_signal(events.clone(), SignalKind::terminate(), "SIGTERM");
        spawn_unix_signal(events.clone(), SignalKind::hangup(), "SIGHUP");
    }

    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            if events.send("Ctrl-C").await.is_err() {
                return;
            }
        }
    });
}

#[cfg(unix)]
fn spawn_unix_signal(events: mpsc::Sender<&'static str>, kind: SignalKind, name: &'static str) {
    tokio::spawn(async move {
        let mut stream = match signal(kind) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to listen for {}: {}", name, e);
                return;
            }
        };
        while stream.recv().await.is_some() {
            if events.send(name).await.is_err() {
                return;
            }
        }
    });
}

/// Print troubleshooting guidance for a failed verdict
fn print_final_analysis(args: &Args, report: &RunReport) {
    let verdict = &report.verdict;

    println!("\nRECONCILIATION ANALYSIS");
    println!("================================");
    for mismatch in verdict.mismatches() {
        println!("MISMATCH: {}", mismatch);
    }

    if verdict.produced == 0 {
        println!("\nCRITICAL: No messages were produced!");
        println!("   - {} publishes failed", report.counters.publish_errors);
        println!("   - Verify broker address: {}", args.broker);
        println!("   - Verify topic '{}' exists and accepts writes", args.topic);
        if report.counters.duplicates > 0 {
            println!(
                "   - {} publishes hit existing nodes; try --keys sequence",
                report.counters.duplicates
            );
        }
    } else if verdict.consumed == 0 {
        println!("\nCRITICAL: No messages were consumed!");
        println!("   - Subscription started at {:?}", args.offset);
        println!("   - {} stream errors were reported", report.counters.stream_errors);
        println!("   - Consider a longer --grace for slow brokers");
    } else if verdict.consumed < verdict.produced {
        let loss_rate =
            ((verdict.produced - verdict.consumed) as f64 / verdict.produced as f64) * 100.0;
        println!(
            "\nMessage loss detected: {:.1}% ({} produced, {} consumed)",
            loss_rate, verdict.produced, verdict.consumed
        );
        if report.producer.interrupted {
            println!("   - Run was interrupted; messages still in flight were not awaited");
        }
    } else if verdict.consumed > verdict.produced {
        println!(
            "\nMore deliveries than publishes: {} extra (redelivery or foreign producers on '{}')",
            verdict.consumed - verdict.produced,
            args.topic
        );
    }

    match verdict.reconciled {
        None => println!("\nNo offsets were observed on any partition"),
        Some(reconciled) if reconciled != verdict.consumed => {
            println!(
                "\nOffset span ({}) differs from deliveries ({}): duplicates or holes inside a partition",
                reconciled, verdict.consumed
            );
            if report.audit.is_none() {
                println!("   Re-run with --track-gaps to locate them");
            }
        }
        Some(_) => {}
    }

    if let Some(audit) = &report.audit {
        for partition in audit.partitions.iter().filter(|p| p.duplicates > 0 || p.missing > 0) {
            println!(
                "   partition {}: {} distinct, {} duplicate deliveries, {} missing offsets",
                partition.partition, partition.distinct, partition.duplicates, partition.missing
            );
        }
    }

    println!("\nPer-partition offset ranges:");
    for (partition, range) in &report.partitions {
        if let (Some(min), Some(max)) = (range.min(), range.max()) {
            println!("   partition {}: [{}, {}]", partition, min, max);
        }
    }
}

async fn run(args: &Args, config: HarnessConfig) -> Result<RunReport> {
    print_startup_info(args, &config);

    let (publisher, stream) = connect_backend(args).await?;
    let harness = Harness::new(config, publisher, stream)?;
    spawn_signal_handlers(harness.interrupt_handle(), harness.shutdown_handle());

    Ok(harness.run().await)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.quiet, args.verbose);

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run with --help for usage");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let report = match run(&args, config).await {
        Ok(report) => report,
        Err(e) => {
            error!("Run failed: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Sent {} in {:.2}s",
        format_bytes(report.producer.bytes_sent),
        report.producer.elapsed_secs
    );
    println!("{}", report.verdict);

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize run report: {}", e),
        }
    }

    if report.verdict.passed() {
        ExitCode::SUCCESS
    } else {
        if !args.quiet {
            print_final_analysis(&args, &report);
        }
        ExitCode::FAILURE
    }
}
