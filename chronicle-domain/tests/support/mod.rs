#![allow(dead_code)]

use chronicle_domain::chronicle_core::aggregate::AggregateDefinition;
use chronicle_domain::chronicle_core::error::Rejection;
use chronicle_domain::chronicle_core::kind::Definition;
use chronicle_domain::chronicle_core::message::{Command, Event, Query, Record};
use chronicle_domain::chronicle_core::projection::ProjectionDefinition;
use chronicle_domain::chronicle_core::retry::ReactionRetryPolicy;
use chronicle_domain::chronicle_core::saga::SagaDefinition;
use chronicle_domain::DomainConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;

pub fn account_of(payload: &Value) -> Option<String> {
    payload.get("account")?.as_str().map(str::to_string)
}

fn amount_of(payload: &Value) -> i64 {
    payload.get("amount").and_then(Value::as_i64).unwrap_or_default()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub opened: bool,
    pub balance: i64,
}

/// 账户聚合：开户、存款、取款
pub fn accounts() -> Definition {
    AggregateDefinition::<Account>::builder("account", "1")
        .executing(
            "open-account",
            |c| account_of(&c.payload),
            |s, c| {
                if s.opened {
                    return Ok(vec![]);
                }
                Ok(vec![Event::new("account-opened", c.payload.clone())])
            },
        )
        .executing(
            "deposit",
            |c| account_of(&c.payload),
            |_, c| {
                if amount_of(&c.payload) <= 0 {
                    return Err(Rejection::new("amount must be positive").into());
                }
                Ok(vec![Event::new("deposited", c.payload.clone())])
            },
        )
        .executing(
            "withdraw",
            |c| account_of(&c.payload),
            |s, c| {
                if s.balance < amount_of(&c.payload) {
                    return Err(Rejection::new("insufficient funds").into());
                }
                Ok(vec![Event::new("withdrawn", c.payload.clone())])
            },
        )
        .applying("account-opened", |s, _| {
            s.opened = true;
            Ok(())
        })
        .applying("deposited", |s, r| {
            s.balance += amount_of(&r.event.payload);
            Ok(())
        })
        .applying("withdrawn", |s, r| {
            s.balance -= amount_of(&r.event.payload);
            Ok(())
        })
        .build()
        .unwrap()
        .into()
}

fn account_of_record(record: &Record) -> Option<String> {
    account_of(&record.event.payload)
}

/// 每个账户一个余额投影，另有一个全局合计投影
pub fn balances() -> Vec<Definition> {
    let balance = ProjectionDefinition::<i64>::builder("balance", "1")
        .applying_for("deposited", account_of_record, |s, r| {
            *s += amount_of(&r.event.payload);
            Ok(())
        })
        .applying_for("withdrawn", account_of_record, |s, r| {
            *s -= amount_of(&r.event.payload);
            Ok(())
        })
        .responding("balance", |q| account_of(&q.payload), |s, _| Ok(json!(s)))
        .build()
        .unwrap();

    let total = ProjectionDefinition::<i64>::builder("total", "1")
        .applying("deposited", |s, r| {
            *s += amount_of(&r.event.payload);
            Ok(())
        })
        .responding_async("total", |_| Some("all".into()), |s, _| async move {
            Ok(json!(s))
        })
        .build()
        .unwrap();

    vec![balance.into(), total.into()]
}

/// 对每笔存款作出反应的 Saga
pub fn notifier<F, Fut>(react: F) -> Definition
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    SagaDefinition::builder("notifier", "1")
        .reacting("deposited", account_of_record, react)
        .build()
        .unwrap()
        .into()
}

pub fn deposit(account: &str, amount: i64) -> Command {
    Command::new("deposit", json!({ "account": account, "amount": amount }))
}

pub fn withdraw(account: &str, amount: i64) -> Command {
    Command::new("withdraw", json!({ "account": account, "amount": amount }))
}

pub fn balance(account: &str) -> Query {
    Query::new("balance", json!({ "account": account }))
}

/// 反应重试阶梯压缩到毫秒级
pub fn fast_config() -> DomainConfig {
    DomainConfig::builder()
        .reaction_retry(ReactionRetryPolicy::new([Duration::from_millis(1); 4]))
        .build()
}

/// 轮询直到条件成立，超时则失败
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
