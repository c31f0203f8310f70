use anyhow::{Context, Result};
use api::*;
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::client::Client;

mod api;
mod client;

const TOKEN_FILE: &str = "access_token";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    url: String,
}
#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Logs in and stores the token for later commands
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    Me,
    CreateMarket {
        #[arg(short, long)]
        title: String,
        #[arg(short, long)]
        description: String,
        /// RFC 3339, e.g. 2030-01-01T00:00:00Z
        #[arg(short, long)]
        close_date: DateTime<Utc>,
        #[arg(short, long)]
        resolve_date: DateTime<Utc>,
    },
    Markets {
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long)]
        page: Option<i64>,
        #[arg(short, long)]
        limit: Option<i64>,
    },
    Market {
        #[arg(short, long)]
        market: RowId,
    },
    Predict {
        #[arg(short, long)]
        market: RowId,
        #[arg(short, long, action = ArgAction::Set)]
        forecast: bool,
        #[arg(short, long)]
        confidence: Confidence,
    },
    Resolve {
        #[arg(short, long)]
        market: RowId,
        #[arg(short, long, action = ArgAction::Set)]
        outcome: bool,
    },
    Close {
        #[arg(short, long)]
        market: RowId,
    },
    Leaderboard {
        #[arg(short, long)]
        page: Option<i64>,
        #[arg(short, long)]
        limit: Option<i64>,
    },
    Stats {
        #[arg(short, long)]
        user: RowId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();
    let mut client = Client::new(cli.url);
    if let Some(token) = read_token().await {
        client.set_token(token);
    }

    match cli.command {
        Commands::Register {
            username,
            email,
            password,
        } => {
            let request = RegisterRequest {
                username: Some(username),
                email: Some(email),
                password: Some(password),
            };
            let response = client.register(request).await?;
            save_token(&response.token).await?;
            print(&response.user)?;
        }
        Commands::Login { email, password } => {
            let request = LoginRequest {
                email: Some(email),
                password: Some(password),
            };
            let response = client.login(request).await?;
            save_token(&response.token).await?;
            println!("Logged in as {}", response.user.username);
        }
        Commands::Me => print(&client.me().await?)?,
        Commands::CreateMarket {
            title,
            description,
            close_date,
            resolve_date,
        } => {
            let request = NewMarketRequest {
                title: Some(title),
                description: Some(description),
                close_date: Some(close_date),
                resolve_date: Some(resolve_date),
            };
            print(&client.create_market(request).await?)?;
        }
        Commands::Markets {
            status,
            page,
            limit,
        } => {
            let status = status.map(|status| status.parse()).transpose()?;
            let query = MarketsQuery {
                page,
                limit,
                status,
            };
            print(&client.get_markets(query).await?)?;
        }
        Commands::Market { market } => print(&client.get_market(market).await?)?,
        Commands::Predict {
            market,
            forecast,
            confidence,
        } => {
            let (prediction, created) = client.predict(market, forecast, confidence).await?;
            if !created {
                println!("Updated existing prediction");
            }
            print(&prediction)?;
        }
        Commands::Resolve { market, outcome } => {
            print(&client.resolve_market(market, outcome).await?)?
        }
        Commands::Close { market } => print(&client.close_market(market).await?)?,
        Commands::Leaderboard { page, limit } => {
            print(&client.leaderboard(PageQuery { page, limit }).await?)?
        }
        Commands::Stats { user } => print(&client.user_stats(user).await?)?,
    }
    Ok(())
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
async fn save_token(token: &str) -> Result<()> {
    let mut file = File::create(TOKEN_FILE)
        .await
        .with_context(|| format!("couldn't create {}", TOKEN_FILE))?;
    file.write_all(token.as_bytes()).await?;
    Ok(())
}
async fn read_token() -> Option<String> {
    let mut file = File::open(TOKEN_FILE).await.ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).await.ok()?;
    Some(contents.trim().to_string())
}
