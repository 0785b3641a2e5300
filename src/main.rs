use std::io::Write;

use log::debug;
use tokio::runtime::Builder;

use nats_ws_gateway::config::Settings;
use nats_ws_gateway::gateway::Gateway;
use nats_ws_gateway::server::run_server;

fn print_usage_and_exit(arg0: String) {
    eprintln!(
        "Usage: {arg0} [--threads/-t N] [--listen/-l ADDR] [--tls] [--trace] <nats server address>"
    );
    std::process::exit(1);
}

fn main() {
    env_logger::builder()
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            // Relayed wire bytes end up in trace output; keep it printable.
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;
    let mut listen_addr = "127.0.0.1:8910".to_string();
    let mut enable_tls = false;
    let mut trace = false;

    while !args.is_empty() && args[0].starts_with('-') {
        if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
                return;
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {e}");
                    print_usage_and_exit(arg0);
                    return;
                }
            };
        } else if args[0] == "--listen" || args[0] == "-l" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing listen address.");
                print_usage_and_exit(arg0);
                return;
            }
            listen_addr = args.remove(0);
        } else if args[0] == "--tls" {
            args.remove(0);
            enable_tls = true;
        } else if args[0] == "--trace" {
            args.remove(0);
            trace = true;
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if args.len() != 1 {
        print_usage_and_exit(arg0);
        return;
    }
    let nats_addr = args.remove(0);

    if num_threads == 0 {
        num_threads = std::cmp::max(
            2,
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
        debug!("Runtime threads: {num_threads}");
    } else {
        println!("Using custom thread count ({num_threads})");
    }

    let mut builder = if num_threads == 1 {
        Builder::new_current_thread()
    } else {
        let mut mt = Builder::new_multi_thread();
        mt.worker_threads(num_threads);
        mt
    };

    let runtime = builder
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    runtime.block_on(async move {
        let mut settings = Settings::new(nats_addr);
        settings.enable_tls = enable_tls;
        settings.trace = trace;

        let gateway = Gateway::new(settings, None);

        println!("Starting websocket gateway at {listen_addr}");

        if let Err(e) = run_server(&listen_addr, gateway).await {
            eprintln!("Server failed: {e}");
            std::process::exit(1);
        }
    });
}
