use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::TrackerError;
use crate::models::{ChannelId, ProductId, Session, StartSession};
use crate::tracker::OvenTracker;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelArgs {
    #[serde(alias = "ovenId")]
    channel_id: ChannelId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductArgs {
    product_id: ProductId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemperatureArgs {
    product_id: ProductId,
    #[serde(default, alias = "startTime")]
    from: Option<DateTime<Utc>>,
    #[serde(default, alias = "endTime")]
    to: Option<DateTime<Utc>>,
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, TrackerError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|err| TrackerError::invalid(err.to_string()))
}

fn to_data<T: serde::Serialize>(value: T) -> Result<Value, TrackerError> {
    serde_json::to_value(value).map_err(|err| TrackerError::Persistence(err.into()))
}

/// The `channelId` of a `save-session` call also fills in a record that
/// carries none.
fn session_record(args: &Value, channel_id: &ChannelId) -> Result<Session, TrackerError> {
    let mut record = args
        .get("session")
        .cloned()
        .ok_or_else(|| TrackerError::invalid("missing field `session`"))?;
    if let Value::Object(fields) = &mut record {
        if !fields.contains_key("channelId") && !fields.contains_key("ovenId") {
            fields.insert("channelId".into(), json!(channel_id));
        }
    }
    parse(record)
}

/// Runs one operation by its wire name.
pub async fn dispatch(
    tracker: &OvenTracker,
    command: &str,
    args: Value,
) -> Result<Value, TrackerError> {
    match command {
        "start-session" => {
            let request: StartSession = parse(args)?;
            to_data(tracker.start_session(request).await?)
        }
        "stop-session" => {
            let ChannelArgs { channel_id } = parse(args)?;
            to_data(tracker.stop_session(&channel_id).await?)
        }
        "get-active-session" => {
            let ChannelArgs { channel_id } = parse(args)?;
            to_data(tracker.get_active_session(&channel_id))
        }
        "save-session" => {
            let ChannelArgs { channel_id } = parse(args.clone())?;
            let session = session_record(&args, &channel_id)?;
            tracker.save_session(&channel_id, session).await?;
            Ok(Value::Null)
        }
        "get-sessions" => {
            let ChannelArgs { channel_id } = parse(args)?;
            to_data(tracker.get_sessions(&channel_id).await?)
        }
        "get-session-temperatures" => {
            let TemperatureArgs {
                product_id,
                from,
                to,
            } = parse(args)?;
            to_data(
                tracker
                    .get_session_temperatures(&product_id, from, to)
                    .await?,
            )
        }
        "check-product-id-exists" => {
            let ProductArgs { product_id } = parse(args)?;
            to_data(tracker.check_product_id_exists(&product_id).await?)
        }
        "read-live-temperature" => to_data(tracker.read_live_temperature()),
        "list-channels" => to_data(tracker.list_channels()),
        "list-products" => to_data(tracker.list_products().await?),
        "retry-pending-sessions" => to_data(tracker.retry_pending_sessions().await?),
        other => Err(TrackerError::invalid(format!("unknown command '{other}'"))),
    }
}
