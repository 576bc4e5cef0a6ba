use clap::{App, Arg};
use htex::config::FabricConfig;
use htex::{fabric, id, invoke};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;

    let default_uid = id::short_uid();
    let default_workers = num_cpus::get().to_string();
    let matches = App::new("fabric")
        .version("0.1")
        .about("Per-node fabric: one coordinator plus its local workers.")
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .help("enable debug logging"),
        )
        .arg(
            Arg::with_name("logdir")
                .short("l")
                .long("logdir")
                .value_name("LOGDIR")
                .default_value("parsl_worker_logs")
                .help("fabric log directory")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("uid")
                .short("u")
                .long("uid")
                .value_name("UID")
                .default_value(&default_uid)
                .help("unique identifier string for this fabric")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("workers")
                .short("w")
                .long("workers")
                .value_name("COUNT")
                .default_value(&default_workers)
                .help("worker slots on this node")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("heartbeat_period")
                .short("b")
                .long("heartbeat_period")
                .value_name("SECONDS")
                .default_value("30")
                .help("heartbeat period agreed with the interchange, in seconds")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("task_url")
                .short("t")
                .long("task_url")
                .value_name("URL")
                .help("REQUIRED: url for receiving tasks")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("result_url")
                .short("r")
                .long("result_url")
                .value_name("URL")
                .help("REQUIRED: url for posting results")
                .required(true)
                .takes_value(true),
        )
        .get_matches();

    let debug = matches.is_present("debug");
    let logdir = matches.value_of("logdir").expect("logdir has a default");
    let uid = matches.value_of("uid").expect("uid has a default");
    let workers: usize = matches
        .value_of("workers")
        .expect("workers has a default")
        .parse()?;
    let heartbeat_secs: u64 = matches
        .value_of("heartbeat_period")
        .expect("heartbeat_period has a default")
        .parse()?;
    let task_url = matches.value_of("task_url").expect("task_url is required");
    let result_url = matches
        .value_of("result_url")
        .expect("result_url is required");

    std::fs::create_dir_all(logdir)?;
    let appender = tracing_appender::rolling::never(logdir, format!("fabric.{}.log", uid));
    let (writer, _guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_max_level(if debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        })
        .with_writer(writer)
        .with_ansi(false)
        .init();

    info!("fabric {} starting with {} workers", uid, workers);
    let mut config = FabricConfig::new(
        task_url,
        result_url,
        workers,
        Duration::from_secs(heartbeat_secs),
    );
    config.uid = uid.to_string();

    fabric::run(config, Arc::new(invoke::builtin())).await?;
    Ok(())
}
