use chronicle_domain::chronicle_core::aggregate::AggregateDefinition;
use chronicle_domain::chronicle_core::error::Rejection;
use chronicle_domain::chronicle_core::message::{Command, Event, Heads, Query, Record};
use chronicle_domain::chronicle_core::persist::Backend;
use chronicle_domain::chronicle_core::projection::ProjectionDefinition;
use chronicle_domain::chronicle_core::saga::SagaDefinition;
use chronicle_domain::Domain;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn account_of(payload: &Value) -> Option<String> {
    payload.get("account")?.as_str().map(str::to_string)
}

fn amount_of(payload: &Value) -> i64 {
    payload.get("amount").and_then(Value::as_i64).unwrap_or_default()
}

fn account_of_record(record: &Record) -> Option<String> {
    account_of(&record.event.payload)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let account = AggregateDefinition::<i64>::builder("account", "1")
        .executing("deposit", |c| account_of(&c.payload), |_, c| {
            Ok(vec![Event::new("deposited", c.payload.clone())])
        })
        .executing("withdraw", |c| account_of(&c.payload), |balance, c| {
            if *balance < amount_of(&c.payload) {
                return Err(Rejection::new("insufficient funds").into());
            }
            Ok(vec![Event::new("withdrawn", c.payload.clone())])
        })
        .applying("deposited", |balance, r| {
            *balance += amount_of(&r.event.payload);
            Ok(())
        })
        .applying("withdrawn", |balance, r| {
            *balance -= amount_of(&r.event.payload);
            Ok(())
        })
        .build()?;

    let balance = ProjectionDefinition::<i64>::builder("balance", "1")
        .applying_for("deposited", account_of_record, |balance, r| {
            *balance += amount_of(&r.event.payload);
            Ok(())
        })
        .applying_for("withdrawn", account_of_record, |balance, r| {
            *balance -= amount_of(&r.event.payload);
            Ok(())
        })
        .responding("balance", |q| account_of(&q.payload), |balance, _| Ok(json!(balance)))
        .build()?;

    let notifier = SagaDefinition::builder("notifier", "1")
        .reacting("deposited", account_of_record, |record| async move {
            println!(
                "notify: account={} amount={}",
                record.stream_id,
                amount_of(&record.event.payload)
            );
            Ok(())
        })
        .build()?;

    let domain = Arc::new(
        Domain::builder()
            .name("bank")
            .backend(Backend::in_memory())
            .meta_backend(Backend::in_memory())
            .definitions(vec![account.into(), balance.into(), notifier.into()])
            .build()?,
    );
    domain.start().await?;

    let mut written = Vec::new();
    for amount in [100, 50] {
        let command = Command::new("deposit", json!({ "account": "alice", "amount": amount }));
        written.extend(domain.execute(command).await?);
    }

    let overdraft = Command::new("withdraw", json!({ "account": "alice", "amount": 500 }));
    if let Err(err) = domain.execute(overdraft).await {
        println!("withdraw refused: kind={:?}, error={err}", err.kind());
    }

    let query = Query::new("balance", json!({ "account": "alice" }))
        .with_heads(Heads::from_records(&written));
    println!("balance: {}", domain.respond_to(query).await?);

    // 给后台反应留出时间
    tokio::time::sleep(Duration::from_millis(100)).await;
    domain.stop().await;
    Ok(())
}
