use clap::{Args, Parser, Subcommand};
use mcplink::http::{HttpClientTransport, HttpServerTransport};
use mcplink::jsonrpc::transport::{StdioTransport, Transport};
use mcplink::jsonrpc::JsonRpcError;
use mcplink::{
    Capability, Config, McpClient, McpServer, MethodContext, RequestHandler,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Globals {
    /// Load settings from a JSON config file.  Anything it leaves out keeps its default.
    #[arg(short, long, value_name = "FILE", global = true, env = "MCPL_CONFIG")]
    config: Option<PathBuf>,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an MCP server with a small set of demo tools.
    ///
    /// By default it listens on stdin and responds on stdout.  Log events are written to stderr.
    Serve {
        /// Serve over HTTP on this address instead of stdio
        #[arg(long, value_name = "ADDR", env = "MCPL_HTTP")]
        http: Option<SocketAddr>,
    },

    /// Connect to an MCP server over HTTP, run the handshake and ping it
    Ping {
        /// URL of the server's MCP endpoint; overrides the config file
        #[arg(long, env = "MCPL_ENDPOINT")]
        endpoint: Option<String>,

        /// How many pings to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
}

/// Tools served by `mcpl serve`
struct DemoTools;

#[async_trait::async_trait]
impl RequestHandler for DemoTools {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        context: MethodContext,
    ) -> Result<Value, JsonRpcError> {
        match method {
            "tools/list" => Ok(json!({
                "tools": [{
                    "name": "echo",
                    "description": "Returns its input",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "text": { "type": "string" } },
                        "required": ["text"]
                    }
                }]
            })),
            "tools/call" => {
                let params = params.unwrap_or_default();
                match params.get("name").and_then(Value::as_str) {
                    Some("echo") => {
                        let text = params
                            .pointer("/arguments/text")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        context.report_progress(0.5, Some(1.0), Some("echoing")).await;
                        Ok(json!({ "content": [{ "type": "text", "text": text }] }))
                    }
                    Some(other) => Err(JsonRpcError::invalid_params(format!(
                        "Unknown tool '{other}'"
                    ))),
                    None => Err(JsonRpcError::invalid_params("Missing tool name")),
                }
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}

impl Commands {
    async fn execute(self, globals: &Globals) -> anyhow::Result<()> {
        let mut config = match &globals.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        match self {
            Commands::Serve { http } => {
                config.server.capabilities = config
                    .server
                    .capabilities
                    .clone()
                    .with(Capability::Tools)
                    .with(Capability::Logging);

                let transport: Arc<dyn Transport> = match http {
                    Some(addr) => {
                        let transport = HttpServerTransport::bind(addr, config.http_server).await?;
                        info!(url = %transport.endpoint_url(), "Listening for HTTP connections");
                        Arc::new(transport)
                    }
                    None => {
                        info!("Listening on stdin");
                        Arc::new(StdioTransport::stdio())
                    }
                };

                let server = McpServer::new(transport, config.server, Arc::new(DemoTools));
                tokio::select! {
                    result = server.serve() => result?,
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl-C detected; shutting down");
                        server.close().await?;
                    }
                }
            }
            Commands::Ping { endpoint, count } => {
                if let Some(endpoint) = endpoint {
                    config.http_client.endpoint = endpoint;
                }
                let transport = HttpClientTransport::new(config.http_client)?;
                let client = McpClient::start(
                    Arc::new(transport),
                    config.client,
                    Arc::new(NoRequests),
                );

                let result = client.initialize().await?;
                println!(
                    "Connected to {} {} (protocol {})",
                    result.server_info.name, result.server_info.version, result.protocol_version
                );

                for seq in 1..=count {
                    let started = Instant::now();
                    client.ping().await?;
                    println!("ping {seq}: {:?}", started.elapsed());
                }

                client.close().await?;
            }
        }

        Ok(())
    }
}

/// The ping client doesn't serve anything to the server
struct NoRequests;
impl RequestHandler for NoRequests {}

#[tokio::main]
async fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("Failed to install error report handler: {e}");
    }

    let cli = Cli::parse();
    let default_log_directive = match cli.globals.debug {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Stdout belongs to the stdio transport, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .json()
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    if let Some(config_path) = cli.globals.config.as_deref() {
        debug!("Value for config: {}", config_path.display());
    }

    if let Err(e) = cli.command.execute(&cli.globals).await {
        error!("{:#}", e);
        exit(1);
    } else {
        debug!("command executed successfully");
    }
}
