// =============================================================================
// Venue Client — typed RPC over the exchange's info + exchange endpoints
// =============================================================================
//
// Stateless apart from a cached instrument table and the injected http client.
// Write operations take a borrowed `AgentSigner` per call, so key material
// never lives inside this type.
//
// Error policy:
//   network timeout / 5xx    -> bounded retry with backoff, then Unavailable
//   429                      -> RateLimited (honours Retry-After)
//   bad params               -> InvalidParams before anything is signed
//   venue-rejected order     -> surfaced inside OrderStatus::Rejected
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::venue::signer::{AgentSigner, ApproveAgentPayload, VenueSignature};
use crate::venue::types::{
    format_tick, round_price, round_size, Instrument, OrderRequest, OrderStatus, OrderType,
    TimeInForce, UserState, VenueOrder, VenuePosition,
};
use crate::types::PositionSide;

/// Retries for transient failures before surfacing Unavailable.
const MAX_RETRIES: u32 = 2;
/// Base backoff between retries.
const RETRY_BASE: Duration = Duration::from_millis(250);

/// Fallback instrument list used only when the upstream `meta` call is
/// rate-limited and no cache exists yet. A policy, not a source of truth.
fn fallback_instruments() -> Vec<Instrument> {
    [
        ("BTC", 5, 50),
        ("ETH", 4, 50),
        ("SOL", 2, 20),
        ("ARB", 1, 10),
        ("AVAX", 2, 10),
    ]
    .iter()
    .map(|(sym, szd, lev)| Instrument {
        symbol: (*sym).to_string(),
        sz_decimals: *szd,
        max_leverage: *lev,
    })
    .collect()
}

struct MetaCache {
    instruments: Vec<Instrument>,
    index_by_symbol: HashMap<String, u32>,
    /// True when populated from the hard-coded fallback; refreshed on the
    /// next successful meta call.
    from_fallback: bool,
}

/// Typed client for the venue's `/info` and `/exchange` endpoints.
pub struct VenueClient {
    http: reqwest::Client,
    base_url: String,
    meta: RwLock<Option<MetaCache>>,
}

impl VenueClient {
    pub fn new(base_url: impl Into<String>, deadline: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .expect("failed to build venue http client");

        Self {
            http,
            base_url: base_url.into(),
            meta: RwLock::new(None),
        }
    }

    pub fn timestamp_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    // -------------------------------------------------------------------------
    // Info endpoint
    // -------------------------------------------------------------------------

    /// List tradeable instruments. Falls back to a hard-coded list when the
    /// upstream is rate-limited and nothing is cached yet.
    #[instrument(skip(self), name = "venue::markets")]
    pub async fn markets(&self) -> Result<Vec<Instrument>, EngineError> {
        match self.post_info(json!({ "type": "meta" })).await {
            Ok(body) => {
                let instruments = parse_meta(&body)?;
                self.install_meta(instruments.clone(), false);
                debug!(count = instruments.len(), "instrument metadata refreshed");
                Ok(instruments)
            }
            Err(EngineError::RateLimited { retry_after_secs }) => {
                if let Some(cache) = self.meta.read().as_ref() {
                    warn!("meta rate-limited — serving cached instruments");
                    return Ok(cache.instruments.clone());
                }
                warn!(
                    ?retry_after_secs,
                    "meta rate-limited with empty cache — serving fallback instrument list"
                );
                let fallback = fallback_instruments();
                self.install_meta(fallback.clone(), true);
                Ok(fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a canonical symbol to its asset index + instrument metadata.
    pub async fn instrument(&self, symbol: &str) -> Result<(u32, Instrument), EngineError> {
        let needs_load = {
            let cache = self.meta.read();
            match cache.as_ref() {
                None => true,
                Some(c) => c.from_fallback && !c.index_by_symbol.contains_key(symbol),
            }
        };
        if needs_load {
            self.markets().await?;
        }

        let cache = self.meta.read();
        let cache = cache
            .as_ref()
            .ok_or_else(|| EngineError::Unavailable("instrument metadata unavailable".into()))?;

        match cache.index_by_symbol.get(symbol) {
            Some(&idx) => Ok((idx, cache.instruments[idx as usize].clone())),
            None => Err(EngineError::invalid(
                "symbol",
                format!("unknown instrument: {symbol}"),
            )),
        }
    }

    /// Clearinghouse state for an address: balances, margin, open positions.
    #[instrument(skip(self), name = "venue::user_state")]
    pub async fn user_state(&self, address: &str) -> Result<UserState, EngineError> {
        let body = self
            .post_info(json!({ "type": "clearinghouseState", "user": address }))
            .await?;
        parse_user_state(&body)
    }

    /// Open positions only (a projection of `user_state`).
    pub async fn positions(&self, address: &str) -> Result<Vec<VenuePosition>, EngineError> {
        Ok(self.user_state(address).await?.positions)
    }

    /// Raw open orders. TP/SL role inference belongs to the caller.
    #[instrument(skip(self), name = "venue::open_orders")]
    pub async fn open_orders(&self, address: &str) -> Result<Vec<VenueOrder>, EngineError> {
        let body = self
            .post_info(json!({ "type": "openOrders", "user": address }))
            .await?;
        parse_open_orders(&body)
    }

    // -------------------------------------------------------------------------
    // Exchange endpoint (signed)
    // -------------------------------------------------------------------------

    /// Sign and submit one order. Size and price are rounded to instrument
    /// tick granularity before signing.
    #[instrument(skip(self, signer, req), fields(symbol = %req.symbol), name = "venue::place_order")]
    pub async fn place_order(
        &self,
        signer: &AgentSigner,
        req: &OrderRequest,
    ) -> Result<OrderStatus, EngineError> {
        if let OrderType::Limit(_) = req.order_type {
            if req.limit_px <= 0.0 {
                return Err(EngineError::invalid(
                    "limit_px",
                    "limit order requires a positive limit price",
                ));
            }
        }
        if req.limit_px <= 0.0 || !req.limit_px.is_finite() {
            return Err(EngineError::invalid(
                "limit_px",
                "price bound must be positive and finite",
            ));
        }
        if req.size <= 0.0 || !req.size.is_finite() {
            return Err(EngineError::invalid("size", "size must be positive"));
        }

        let (asset, instrument) = self.instrument(&req.symbol).await?;

        let px = round_price(req.limit_px, instrument.sz_decimals);
        let sz = round_size(req.size, instrument.sz_decimals);
        if sz <= 0.0 {
            return Err(EngineError::invalid(
                "size",
                format!("size rounds to zero at {} decimals", instrument.sz_decimals),
            ));
        }

        // A market order is an aggressive IOC limit at the price bound.
        let tif = match req.order_type {
            OrderType::Market => TimeInForce::Ioc,
            OrderType::Limit(tif) => tif,
        };

        let action = json!({
            "type": "order",
            "orders": [{
                "a": asset,
                "b": req.is_buy,
                "p": format_tick(px),
                "s": format_tick(sz),
                "r": req.reduce_only,
                "t": { "limit": { "tif": tif.as_wire() } }
            }],
            "grouping": "na"
        });

        let body = self.post_exchange(signer, action).await?;
        let status = parse_order_response(&body)?;
        info!(symbol = %req.symbol, is_buy = req.is_buy, px, sz, ?status, "order submitted");
        Ok(status)
    }

    /// Cancel a resting order by oid.
    #[instrument(skip(self, signer), name = "venue::cancel_order")]
    pub async fn cancel_order(
        &self,
        signer: &AgentSigner,
        symbol: &str,
        oid: u64,
    ) -> Result<(), EngineError> {
        let (asset, _) = self.instrument(symbol).await?;
        let action = json!({
            "type": "cancel",
            "cancels": [{ "a": asset, "o": oid }]
        });

        let body = self.post_exchange(signer, action).await?;
        check_plain_ok(&body)?;
        info!(symbol, oid, "order cancelled");
        Ok(())
    }

    /// Set leverage for an instrument.
    #[instrument(skip(self, signer), name = "venue::update_leverage")]
    pub async fn update_leverage(
        &self,
        signer: &AgentSigner,
        symbol: &str,
        is_cross: bool,
        leverage: u32,
    ) -> Result<(), EngineError> {
        if leverage == 0 {
            return Err(EngineError::invalid("leverage", "leverage must be >= 1"));
        }
        let (asset, instrument) = self.instrument(symbol).await?;
        if leverage > instrument.max_leverage {
            return Err(EngineError::invalid(
                "leverage",
                format!(
                    "requested {leverage}x exceeds venue max {}x for {symbol}",
                    instrument.max_leverage
                ),
            ));
        }

        let action = json!({
            "type": "updateLeverage",
            "asset": asset,
            "isCross": is_cross,
            "leverage": leverage
        });

        let body = self.post_exchange(signer, action).await?;
        check_plain_ok(&body)?;
        info!(symbol, leverage, is_cross, "leverage updated");
        Ok(())
    }

    /// Submit a pre-signed agent approval. The main wallet signs the typed
    /// data externally; the core never holds that key.
    #[instrument(skip(self, payload, signature), name = "venue::approve_agent")]
    pub async fn approve_agent(
        &self,
        payload: &ApproveAgentPayload,
        signature: &VenueSignature,
    ) -> Result<(), EngineError> {
        let action = json!({
            "type": "approveAgent",
            "hyperliquidChain": payload.hyperliquid_chain,
            "signatureChainId": payload.signature_chain_id,
            "agentAddress": payload.agent_address,
            "agentName": payload.agent_name,
            "nonce": payload.nonce
        });

        let request = json!({
            "action": action,
            "nonce": payload.nonce,
            "signature": { "r": signature.r, "s": signature.s, "v": signature.v }
        });

        let body = self.post_raw("/exchange", request).await?;
        check_plain_ok(&body)?;
        info!(agent = %payload.agent_address, "agent approval submitted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn install_meta(&self, instruments: Vec<Instrument>, from_fallback: bool) {
        let index_by_symbol = instruments
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.symbol.clone(), i as u32))
            .collect();
        *self.meta.write() = Some(MetaCache {
            instruments,
            index_by_symbol,
            from_fallback,
        });
    }

    async fn post_exchange(
        &self,
        signer: &AgentSigner,
        action: Value,
    ) -> Result<Value, EngineError> {
        let nonce = Self::timestamp_ms();
        let signature = signer
            .sign_l1_action(&action, nonce, None)
            .map_err(|e| EngineError::Invariant(format!("signing failed: {e}")))?;

        let request = json!({
            "action": action,
            "nonce": nonce,
            "signature": { "r": signature.r, "s": signature.s, "v": signature.v }
        });

        self.post_raw("/exchange", request).await
    }

    async fn post_info(&self, body: Value) -> Result<Value, EngineError> {
        self.post_raw("/info", body).await
    }

    /// POST with bounded retry on transient failures. Rate limits and 4xx are
    /// never retried here.
    async fn post_raw(&self, path: &str, body: Value) -> Result<Value, EngineError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            let result = self.http.post(&url).json(&body).send().await;

            let err = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 {
                        let retry_after_secs = resp
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse().ok());
                        return Err(EngineError::RateLimited { retry_after_secs });
                    }
                    if status.is_server_error() {
                        EngineError::Unavailable(format!("venue returned {status}"))
                    } else if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        return Err(EngineError::invalid(
                            "request",
                            format!("venue returned {status}: {text}"),
                        ));
                    } else {
                        return resp.json::<Value>().await.map_err(|e| {
                            EngineError::Unavailable(format!("venue response unreadable: {e}"))
                        });
                    }
                }
                Err(e) if e.is_timeout() => {
                    EngineError::Unavailable(format!("venue request timed out: {e}"))
                }
                Err(e) => EngineError::Unavailable(format!("venue request failed: {e}")),
            };

            if attempt >= MAX_RETRIES {
                return Err(err);
            }
            attempt += 1;
            let delay = RETRY_BASE * 2u32.pow(attempt - 1);
            warn!(attempt, ?delay, error = %err, "venue request failed — retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for VenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Response parsing
// =============================================================================

fn parse_f64(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_meta(body: &Value) -> Result<Vec<Instrument>, EngineError> {
    let universe = body["universe"]
        .as_array()
        .ok_or_else(|| EngineError::Unavailable("meta response missing universe".into()))?;

    let mut instruments = Vec::with_capacity(universe.len());
    for entry in universe {
        let symbol = entry["name"]
            .as_str()
            .ok_or_else(|| EngineError::Unavailable("universe entry missing name".into()))?
            .to_string();
        let sz_decimals = entry["szDecimals"].as_u64().unwrap_or(0) as u32;
        let max_leverage = entry["maxLeverage"].as_u64().unwrap_or(1) as u32;
        instruments.push(Instrument {
            symbol,
            sz_decimals,
            max_leverage,
        });
    }
    Ok(instruments)
}

fn parse_user_state(body: &Value) -> Result<UserState, EngineError> {
    let summary = &body["marginSummary"];
    let account_value = parse_f64(&summary["accountValue"]).unwrap_or(0.0);
    let total_margin_used = parse_f64(&summary["totalMarginUsed"]).unwrap_or(0.0);
    let withdrawable = parse_f64(&body["withdrawable"]).unwrap_or(0.0);

    let mut positions = Vec::new();
    if let Some(entries) = body["assetPositions"].as_array() {
        for entry in entries {
            let pos = &entry["position"];
            let symbol = match pos["coin"].as_str() {
                Some(c) => c.to_string(),
                None => continue,
            };
            let szi = parse_f64(&pos["szi"]).unwrap_or(0.0);
            if szi == 0.0 {
                continue;
            }
            let side = if szi > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            positions.push(VenuePosition {
                symbol,
                side,
                size: szi.abs(),
                entry_px: parse_f64(&pos["entryPx"]).unwrap_or(0.0),
                leverage: pos["leverage"]["value"].as_u64().unwrap_or(1) as u32,
                unrealized_pnl: parse_f64(&pos["unrealizedPnl"]).unwrap_or(0.0),
                margin_used: parse_f64(&pos["marginUsed"]).unwrap_or(0.0),
                liquidation_px: parse_f64(&pos["liquidationPx"]),
            });
        }
    }

    Ok(UserState {
        account_value,
        total_margin_used,
        withdrawable,
        positions,
    })
}

fn parse_open_orders(body: &Value) -> Result<Vec<VenueOrder>, EngineError> {
    let entries = body
        .as_array()
        .ok_or_else(|| EngineError::Unavailable("openOrders response is not an array".into()))?;

    let mut orders = Vec::with_capacity(entries.len());
    for entry in entries {
        let symbol = match entry["coin"].as_str() {
            Some(c) => c.to_string(),
            None => continue,
        };
        orders.push(VenueOrder {
            oid: entry["oid"].as_u64().unwrap_or(0),
            symbol,
            is_buy: entry["side"].as_str() == Some("B"),
            limit_px: parse_f64(&entry["limitPx"]).unwrap_or(0.0),
            size: parse_f64(&entry["sz"]).unwrap_or(0.0),
            orig_size: parse_f64(&entry["origSz"]).unwrap_or(0.0),
            trigger_px: parse_f64(&entry["triggerPx"]).filter(|px| *px > 0.0),
            reduce_only: entry["reduceOnly"].as_bool().unwrap_or(false),
            timestamp_ms: entry["timestamp"].as_i64().unwrap_or(0),
        });
    }
    Ok(orders)
}

fn parse_order_response(body: &Value) -> Result<OrderStatus, EngineError> {
    if body["status"].as_str() != Some("ok") {
        let reason = body["response"]
            .as_str()
            .or_else(|| body["status"].as_str())
            .unwrap_or("unknown exchange error")
            .to_string();
        return Ok(OrderStatus::Rejected { reason });
    }

    let status = &body["response"]["data"]["statuses"][0];
    if let Some(resting) = status.get("resting") {
        return Ok(OrderStatus::Resting {
            oid: resting["oid"].as_u64().unwrap_or(0),
        });
    }
    if let Some(filled) = status.get("filled") {
        return Ok(OrderStatus::Filled {
            oid: filled["oid"].as_u64().unwrap_or(0),
            avg_px: parse_f64(&filled["avgPx"]).unwrap_or(0.0),
            total_sz: parse_f64(&filled["totalSz"]).unwrap_or(0.0),
        });
    }
    if let Some(err) = status.get("error").and_then(|e| e.as_str()) {
        return Ok(OrderStatus::Rejected {
            reason: err.to_string(),
        });
    }

    Err(EngineError::Unavailable(
        "order response carried no recognisable status".into(),
    ))
}

fn check_plain_ok(body: &Value) -> Result<(), EngineError> {
    if body["status"].as_str() == Some("ok") {
        // Per-item errors still possible inside statuses.
        if let Some(statuses) = body["response"]["data"]["statuses"].as_array() {
            for status in statuses {
                if let Some(err) = status.get("error").and_then(|e| e.as_str()) {
                    return Err(EngineError::invalid("request", err.to_string()));
                }
            }
        }
        return Ok(());
    }
    let reason = body["response"]
        .as_str()
        .unwrap_or("unknown exchange error")
        .to_string();
    Err(EngineError::invalid("request", reason))
}
