use alloy_primitives::B256;
use async_trait::async_trait;
use serde::Deserialize;

use super::{Acquired, Loader};
use crate::{
    abi::EventSig,
    config::CompiledIngester,
    context::Context,
    error::LoadError,
    model::split_chain_addr,
    transform::Payload,
    value::Value,
    vitals::VitalsTimer,
};

/// Block-range chunk per eth_getLogs request.
const LOG_CHUNK: u64 = 2000;

#[derive(Debug, Deserialize)]
struct RawLog {
    topics: Vec<String>,
    data: String,
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
}

/// Event log acquisition. Polled mode fetches `[last_block + 1, head]` in
/// bounded chunks at each tick and decodes every matching log into one
/// positional tuple; the first tick only records the head, so no
/// historical backfill happens. In perpetual mode a background task polls
/// continuously into the ingester's bucket and the tick drains it.
pub struct EvmLogLoader;

#[async_trait]
impl Loader for EvmLogLoader {
    async fn acquire(&self, ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError> {
        let timer = VitalsTimer::start();

        let rows = if ctx.settings.perpetual_indexing {
            let bucket = ctx.bucket(&ci.spec.name);
            let mut guard = bucket.lock().await;
            std::mem::take(&mut *guard)
        } else {
            poll_logs(ctx, ci).await?
        };

        let vitals = timer.stop(0, 0, rows.len() as u32);
        Ok(Acquired {
            payload: Payload::Tuples(rows),
            vitals,
        })
    }
}

/// One polling pass: advance the block cursor and decode matching logs.
async fn poll_logs(ctx: &Context, ci: &CompiledIngester) -> Result<Vec<Vec<Value>>, LoadError> {
    let target = ci
        .spec
        .target
        .as_deref()
        .or_else(|| ci.spec.fields.first().and_then(|f| f.target.as_deref()))
        .ok_or_else(|| LoadError::Payload(format!("{} declares no target", ci.spec.name)))?;
    let selector = ci
        .spec
        .selector
        .as_deref()
        .or_else(|| ci.spec.fields.first().and_then(|f| f.selector.as_deref()))
        .ok_or_else(|| {
            LoadError::Payload(format!("{} declares no event signature", ci.spec.name))
        })?;

    let (chain_id, address) =
        split_chain_addr(target).map_err(|e| LoadError::Payload(e.to_string()))?;
    let event = EventSig::parse(selector)?;
    let pool = ctx.rpc.get(chain_id)?;

    let head = fetch_block_number(ctx, &pool).await?;
    let from = match ctx.log_cursors.get(&ci.spec.name).map(|c| *c) {
        Some(last) => last + 1,
        None => {
            ctx.log_cursors.insert(ci.spec.name.clone(), head);
            return Ok(Vec::new());
        }
    };
    if from > head {
        return Ok(Vec::new());
    }

    let mut rows = Vec::new();
    let mut chunk_from = from;
    while chunk_from <= head {
        let chunk_to = (chunk_from + LOG_CHUNK - 1).min(head);
        let result = pool
            .request(
                "eth_getLogs",
                serde_json::json!([{
                    "address": address,
                    "topics": [format!("0x{}", hex::encode(event.topic0()))],
                    "fromBlock": format!("0x{chunk_from:x}"),
                    "toBlock": format!("0x{chunk_to:x}"),
                }]),
                ctx.settings.max_retries,
            )
            .await?;

        let logs: Vec<RawLog> = serde_json::from_value(result)
            .map_err(|e| LoadError::Payload(format!("malformed log response: {e}")))?;
        for log in logs {
            rows.push(decode_raw_log(&event, &log)?);
        }
        chunk_from = chunk_to + 1;
    }

    ctx.log_cursors.insert(ci.spec.name.clone(), head);
    Ok(rows)
}

async fn fetch_block_number(ctx: &Context, pool: &crate::rpc::RpcPool) -> Result<u64, LoadError> {
    let result = pool
        .request(
            "eth_blockNumber",
            serde_json::json!([]),
            ctx.settings.max_retries,
        )
        .await?;
    let hex_str = result
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .ok_or_else(|| LoadError::Payload("eth_blockNumber returned non-hex".to_string()))?;
    u64::from_str_radix(hex_str, 16)
        .map_err(|_| LoadError::Payload("eth_blockNumber returned invalid hex".to_string()))
}

fn decode_raw_log(event: &EventSig, log: &RawLog) -> Result<Vec<Value>, LoadError> {
    let mut topics = Vec::with_capacity(log.topics.len());
    for topic in &log.topics {
        let raw = topic.strip_prefix("0x").unwrap_or(topic);
        let bytes =
            hex::decode(raw).map_err(|_| LoadError::Payload("log topic is not hex".to_string()))?;
        if bytes.len() != 32 {
            return Err(LoadError::Payload("log topic is not 32 bytes".to_string()));
        }
        topics.push(B256::from_slice(&bytes));
    }
    let data = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data))
        .map_err(|_| LoadError::Payload("log data is not hex".to_string()))?;

    let mut row = event.decode_log(&topics, &data)?;
    if let Some(block_hex) = log
        .block_number
        .as_deref()
        .and_then(|b| b.strip_prefix("0x"))
    {
        if let Ok(block) = u64::from_str_radix(block_hex, 16) {
            // appended so a trailing field can persist the block height
            row.push(Value::UInt(block));
        }
    }
    Ok(row)
}

/// Background subscription task for perpetual mode: polls continuously and
/// pushes decoded tuples into the ingester's bucket; the tick flushes the
/// bucket under the usual claim discipline.
pub async fn run_perpetual(ctx: std::sync::Arc<Context>, ci: CompiledIngester) {
    let poll = std::time::Duration::from_secs((ci.spec.interval.seconds() / 4).clamp(1, 15));
    loop {
        match poll_logs(&ctx, &ci).await {
            Ok(rows) if !rows.is_empty() => {
                let bucket = ctx.bucket(&ci.spec.name);
                bucket.lock().await.extend(rows);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(name = %ci.spec.name, error = %err, "perpetual log poll failed");
            }
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_raw_log_with_block_suffix() {
        let event =
            EventSig::parse("Transfer(address indexed from, address indexed to, uint256 value)")
                .unwrap();
        let topic0 = format!("0x{}", hex::encode(event.topic0()));
        let log = RawLog {
            topics: vec![
                topic0,
                format!("0x{}", hex::encode([0u8; 32])),
                format!("0x{}", hex::encode([0u8; 32])),
            ],
            data: format!("0x{}", hex::encode({
                let mut word = [0u8; 32];
                word[31] = 9;
                word
            })),
            block_number: Some("0x10".to_string()),
        };
        let row = decode_raw_log(&event, &log).unwrap();
        assert_eq!(row.len(), 4);
        assert_eq!(row[2], Value::UInt(9));
        assert_eq!(row[3], Value::UInt(16));
    }

    #[test]
    fn rejects_short_topics() {
        let event = EventSig::parse("Ping(uint256 n)").unwrap();
        let log = RawLog {
            topics: vec!["0xabcd".to_string()],
            data: "0x".to_string(),
            block_number: None,
        };
        assert!(decode_raw_log(&event, &log).is_err());
    }
}
