mod gateway;
mod poller;

use anyhow::Result;
use clap::Parser;
use shared::ConfirmRequest;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::gateway::HttpGateway;
use crate::poller::{PollConfig, PollOutcome, RecoveryPoller};

#[derive(Parser)]
#[command(name = "checkout-client")]
struct Args {
    #[arg(long, env = "ORDER_SERVICE_URL", default_value = "http://localhost:3001")]
    api_url: String,

    #[arg(long)]
    payment_reference: String,

    #[arg(long)]
    user_id: Uuid,

    #[arg(long, default_value = "3")]
    poll_interval_secs: u64,

    #[arg(long, default_value = "10")]
    max_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let gateway = HttpGateway::new(&args.api_url)?;
    let config = PollConfig {
        interval: Duration::from_secs(args.poll_interval_secs),
        max_attempts: args.max_attempts.max(1),
    };
    let poller = RecoveryPoller::new(
        gateway,
        config,
        ConfirmRequest {
            payment_reference: args.payment_reference.clone(),
            user_id: args.user_id,
        },
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    info!(payment_reference = %args.payment_reference, "Waiting for order confirmation");
    let outcome = poller.run(&cancel).await;

    match &outcome {
        PollOutcome::Found(order) => info!(order_id = %order.id, "Order found"),
        PollOutcome::Recovered(handle) => {
            info!(order_id = %handle.order_id, created = handle.created, "Order recovered by confirmation")
        }
        PollOutcome::NotSucceeded(status) => info!(%status, "Payment has not succeeded"),
        PollOutcome::ContactSupport(reason) => tracing::error!("Order could not be confirmed: {}", reason),
        PollOutcome::Cancelled => info!("Polling cancelled"),
    }

    println!("{}", outcome.user_message(&args.payment_reference));
    Ok(())
}
