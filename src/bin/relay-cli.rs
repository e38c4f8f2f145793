use clap::{ArgAction, Parser, Subcommand};
use std::process::ExitCode;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Management CLI for the outbound relay", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show dependency and breaker health
    Health,
    /// List active subscriptions
    List,
    /// Show one subscription
    Get { id: String },
    /// Register a subscription
    Add {
        /// Endpoint receiving events
        url: String,
        /// Event types, comma separated ("*" for all)
        #[arg(short, long, value_delimiter = ',', required = true)]
        events: Vec<String>,
        /// HMAC secret; generated when omitted
        #[arg(short, long)]
        secret: Option<String>,
        #[arg(long)]
        retry_count: Option<u32>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        rate_limit: Option<u32>,
    },
    /// Enable or disable a subscription
    Toggle {
        id: String,
        /// `true` or `false`
        #[arg(long, action = ArgAction::Set)]
        enabled: bool,
    },
    /// Remove a subscription (kept for audit)
    Remove { id: String },
    /// Send a webhook.test event
    Test { id: String },
    /// Recent delivery records
    Deliveries {
        id: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Trigger an event with a JSON payload
    Trigger {
        event: String,
        #[arg(default_value = "{}")]
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let request = match cli.command {
        Commands::Health => client.get(format!("{base}/health")),
        Commands::List => client.get(format!("{base}/subscriptions")),
        Commands::Get { id } => client.get(format!("{base}/subscriptions/{id}")),
        Commands::Add {
            url,
            events,
            secret,
            retry_count,
            timeout_ms,
            rate_limit,
        } => client.post(format!("{base}/subscriptions")).json(&json!({
            "url": url,
            "events": events,
            "secret": secret,
            "retry_count": retry_count,
            "timeout_ms": timeout_ms,
            "rate_limit": rate_limit,
        })),
        Commands::Toggle { id, enabled } => client
            .patch(format!("{base}/subscriptions/{id}"))
            .json(&json!({ "enabled": enabled })),
        Commands::Remove { id } => client.delete(format!("{base}/subscriptions/{id}")),
        Commands::Test { id } => client.post(format!("{base}/subscriptions/{id}/test")),
        Commands::Deliveries { id, limit } => {
            client.get(format!("{base}/subscriptions/{id}/deliveries?limit={limit}"))
        }
        Commands::Trigger { event, data } => {
            let data: Value = serde_json::from_str(&data)?;
            client
                .post(format!("{base}/events"))
                .json(&json!({ "event": event, "data": data }))
        }
    };

    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(ExitCode::FAILURE);
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(ExitCode::SUCCESS);
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(ExitCode::SUCCESS)
}
