use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "pipe-cli")]
#[command(about = "Send requests to an rpc-pipe gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Extra request header as NAME=VALUE; repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call the echo service
    Echo { value: String },
    /// POST a raw JSON body to a gateway route
    Call {
        path: String,
        #[arg(default_value = "{}")]
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for pair in &cli.headers {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("header {pair:?} is not NAME=VALUE"))?;
        headers.append(HeaderName::from_bytes(name.trim().as_bytes())?, HeaderValue::from_str(value.trim())?);
    }

    let (path, body) = match cli.command {
        Commands::Echo { value } => ("/echo".to_string(), json!({ "value": value })),
        Commands::Call { path, body } => (path, serde_json::from_str::<Value>(&body)?),
    };

    let res = client
        .post(format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers)
        .json(&body)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: gateway returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
