//! Greeter demo: `tether-hello serve` runs the hello service, `tether-hello call`
//! issues one unary and one streaming call against it.

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;

use tether_rpc::hello::{self, HelloReply, HelloRequest};
use tether_rpc::{Channel, ClientConfig, Config, InterceptorChain, LoggingInterceptor, Server};

#[derive(Parser)]
#[command(name = "tether-hello")]
#[command(about = "Greeter demo for the tether RPC core")]
struct Args {
    /// JSON config file (optional, flags override it)
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the hello service
    Serve {
        #[arg(short, long, env = "TETHER_PORT", default_value_t = 50051)]
        port: u16,
    },
    /// Call the hello service
    Call {
        #[arg(short, long, env = "TETHER_ADDR", default_value = "localhost:50051")]
        addr: String,

        #[arg(short, long, default_value = "world")]
        name: String,

        /// Per-call timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };

    tether_rpc::observability::init_tracing_with(&config.observability);

    match args.command {
        Command::Serve { port } => {
            let mut server_config = config.server;
            server_config.listen_addr = format!("0.0.0.0:{}", port);
            let server = Server::with_interceptors(
                server_config,
                hello::router(),
                InterceptorChain::new().layer(LoggingInterceptor),
            )?;

            tokio::select! {
                result = server.serve() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received");
                    server.shutdown();
                }
            }
        }
        Command::Call { addr, name, timeout } => {
            let channel = Channel::new(ClientConfig {
                address: addr,
                ..config.client
            })?;
            let timeout = Some(Duration::from_secs(timeout));
            let request = HelloRequest { name };

            let reply: HelloReply = channel.unary(hello::SAY_HELLO, &request, timeout).await?;
            tracing::info!("unary reply: {} (at {})", reply.message, reply.timestamp);

            let mut stream = channel
                .server_stream::<_, HelloReply>(hello::SAY_HELLO_STREAM, &request, timeout)
                .await?;
            let mut count = 0;
            while let Some(reply) = stream.next().await {
                let reply = reply?;
                count += 1;
                tracing::info!("stream reply {}: {}", count, reply.message);
            }
            tracing::info!("stream finished after {} messages", count);
            channel.close().await;
        }
    }

    Ok(())
}
