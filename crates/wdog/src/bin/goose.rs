use std::env;

use goose::prelude::*;
use rand::Rng;
use serde_json::json;
use wdog::protocol::RunResult;

const MAX_ECHO_BYTES: usize = 4 * 1024;

async fn setup_custom_client(user: &mut GooseUser) -> TransactionResult {
    use reqwest::Client;

    let builder = Client::builder().gzip(true);
    user.set_client_builder(builder).await?;
    Ok(())
}

fn run_payload(token: &str, out: &str) -> serde_json::Value {
    json!({
        "podtoken": token,
        "args": {
            "out": out,
            "ret": out.len().to_string(),
        },
    })
}

fn random_output(max_bytes: usize) -> String {
    let mut rng = rand::rng();
    let len = rng.random_range(1..=max_bytes);
    (0..len)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}

async fn run_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let token = env::var("SWD_POD_TOKEN").unwrap_or_default();
    let out = random_output(MAX_ECHO_BYTES);
    let payload = run_payload(&token, &out);
    let mut goose = user.post_json("/v1/run", &payload).await?;
    let response = goose
        .response
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    if !status.is_success() {
        return user.set_failure(
            &format!("status {}", status.as_u16()),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    let result: RunResult = match serde_json::from_str(&body) {
        Ok(result) => result,
        Err(_) => return user.set_failure("invalid json", &mut goose.request, None, Some(&body)),
    };
    if result.code >= 300 {
        return user.set_failure(
            &format!("code {}", result.code),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    // Output of other calls must never show up in this one.
    if result.stdout != out {
        return user.set_failure("stdout mismatch", &mut goose.request, None, Some(&body));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("run_roundtrip")
                .register_transaction(transaction!(setup_custom_client).set_on_start())
                .register_transaction(transaction!(run_roundtrip)),
        )
        .execute()
        .await?;
    Ok(())
}
