//! The relay state machine.
//!
//! ```text
//! Validating -> Reserving -> Sending -> Receiving -> Success -> Settling (background)
//!                               |           |
//!                               +-----------+-> Rollback (release reservation)
//! ```
//!
//! A [`QuotaReservation`] is moved into exactly one of `release` (rollback) or
//! the settlement queue (success); the borrow checker enforces the rest.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{RelayError, Result};
use crate::tokenizer::TokenCounter;

use super::adaptor::{
    build_request_body, is_error_happened, upstream_error, Adaptor, AdaptorRegistry,
    ResponseOutcome,
};
use super::billing::{ModelRatioProvider, PriceSnapshot};
use super::extract::extract;
use super::ledger::{QuotaLedger, QuotaReservation};
use super::meta::RelayMeta;
use super::normalize::{ModelMapping, NormalizedRequest, RequestNormalizer};
use super::request::Usage;
use super::settle::{SettlementJob, SettlementQueue};
use super::stats::RelayStats;
use super::tap::{CapturedResponse, ResponseTap, ResponseWriter};

/// Stage of a relay call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    /// Parsing and validating the inbound request.
    Validating,
    /// Reserving quota.
    Reserving,
    /// Building and sending the backend request.
    Sending,
    /// Reading the backend response and writing the client response.
    Receiving,
    /// Response delivered.
    Success,
    /// Reservation being released after a failure.
    Rollback,
    /// Settlement handed to the background queue.
    Settling,
}

impl RelayPhase {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Reserving => "reserving",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Success => "success",
            Self::Rollback => "rollback",
            Self::Settling => "settling",
        }
    }
}

impl fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful relay call.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySummary {
    /// Correlates the call's log lines.
    pub request_id: Uuid,
    /// Usage the call was billed for.
    pub usage: Usage,
    /// Quota reserved up front.
    pub pre_consumed: i64,
    /// Quota owed; settled in the background.
    pub billed: i64,
    /// Ratios used for both amounts.
    pub prices: PriceSnapshot,
}

/// Sequences one relay call and owns its billing protocol.
pub struct Relay {
    ratios: Arc<dyn ModelRatioProvider>,
    ledger: Arc<dyn QuotaLedger>,
    counter: Arc<dyn TokenCounter>,
    adaptors: Arc<AdaptorRegistry>,
    settlement: SettlementQueue,
    stats: Arc<RelayStats>,
    pre_consumed_quota: i64,
}

impl Relay {
    /// Create a relay. Starts the settlement worker, so it must be called
    /// inside a tokio runtime.
    pub fn new(
        ratios: Arc<dyn ModelRatioProvider>,
        ledger: Arc<dyn QuotaLedger>,
        counter: Arc<dyn TokenCounter>,
        adaptors: Arc<AdaptorRegistry>,
        billing: &BillingConfig,
    ) -> Self {
        let stats = Arc::new(RelayStats::new());
        let settlement = SettlementQueue::spawn(
            ledger.clone(),
            stats.clone(),
            billing.settlement_workers,
            billing.settlement_queue,
        );

        Self {
            ratios,
            ledger,
            counter,
            adaptors,
            settlement,
            stats,
            pre_consumed_quota: billing.pre_consumed_quota,
        }
    }

    /// Statistics shared with the HTTP surface.
    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// The ledger reservations are made against.
    pub fn ledger(&self) -> &Arc<dyn QuotaLedger> {
        &self.ledger
    }

    /// Wait for queued settlements; later submissions settle on their own tasks.
    pub async fn shutdown(&self) {
        self.settlement.shutdown().await;
    }

    /// Relay one call.
    ///
    /// `meta` carries the channel and account; `body` is the raw inbound
    /// payload. The client response is written to `writer`, which is dropped
    /// before this returns. An error returned before the writer's head was
    /// written left the client untouched.
    pub async fn relay<W: ResponseWriter>(
        &self,
        mut meta: RelayMeta,
        body: Bytes,
        writer: W,
    ) -> Result<RelaySummary> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        // Validating
        let normalized = match self.validate(&mut meta, &body) {
            Ok(normalized) => normalized,
            Err(e) => {
                tracing::warn!(%request_id, phase = %RelayPhase::Validating, "Request rejected: {}", e);
                self.stats.record_error(false);
                return Err(e);
            },
        };
        self.stats.record_request(meta.is_stream);

        let adaptor = match self.prepare_adaptor(&meta) {
            Ok(adaptor) => adaptor,
            Err(e) => {
                tracing::warn!(%request_id, api_type = %meta.api_type, "No usable adaptor: {}", e);
                self.stats.record_error(false);
                return Err(e);
            },
        };

        // Reserving
        let prices = PriceSnapshot::resolve(self.ratios.as_ref(), &meta.actual_model, &meta.group);
        let pre_consumed = prices.pre_consumed_quota(
            meta.prompt_tokens,
            normalized.request.max_tokens_or_zero(),
            self.pre_consumed_quota,
        );
        let reservation = match self.ledger.reserve(&meta.account, pre_consumed).await {
            Ok(reservation) => reservation,
            Err(e) => {
                tracing::warn!(
                    %request_id,
                    phase = %RelayPhase::Reserving,
                    account = %meta.account,
                    pre_consumed,
                    "Pre-consume failed: {}",
                    e
                );
                self.stats.record_error(false);
                return Err(e);
            },
        };
        self.stats.record_reserved(pre_consumed);
        tracing::debug!(%request_id, reservation = %reservation, "Quota reserved");

        // Sending + Receiving
        let exchanged = self
            .exchange(request_id, adaptor.as_ref(), &meta, &normalized, &body, writer)
            .await;

        let (outcome, captured) = match exchanged {
            Ok(exchanged) => exchanged,
            Err(e) => return Err(self.rollback(request_id, reservation, e).await),
        };

        // Success
        tracing::info!(
            target: "relay::audit",
            %request_id,
            timestamp = %audit_timestamp(),
            "Extracted content:<responseBody> {}</responseBody>",
            extract(&captured)
        );

        let usage = self.resolve_usage(&meta, &outcome);
        let billed = prices.final_quota(&usage);
        self.stats.record_success(
            usage.prompt_tokens,
            usage.completion_tokens,
            billed,
            started.elapsed(),
        );

        // Settling
        tracing::debug!(%request_id, phase = %RelayPhase::Settling, billed, pre_consumed, "Scheduling settlement");
        self.settlement.submit(SettlementJob {
            reservation,
            quota: billed,
            usage,
            model: meta.actual_model.clone(),
            channel_id: meta.channel_id,
            prices,
        });

        Ok(RelaySummary {
            request_id,
            usage,
            pre_consumed,
            billed,
            prices,
        })
    }

    fn validate(&self, meta: &mut RelayMeta, body: &[u8]) -> Result<NormalizedRequest> {
        let mapper = ModelMapping::new(meta.model_mapping.clone());
        let normalizer = RequestNormalizer::new(&mapper, self.counter.as_ref());
        let normalized = normalizer.normalize(body, meta.mode)?;

        meta.origin_model = normalized.origin_model.clone();
        meta.actual_model = normalized.request.model.clone();
        meta.is_stream = normalized.request.stream;
        meta.prompt_tokens = normalized.prompt_tokens;

        Ok(normalized)
    }

    fn prepare_adaptor(&self, meta: &RelayMeta) -> Result<Box<dyn Adaptor>> {
        let mut adaptor = self.adaptors.adaptor_for(meta.api_type)?;
        adaptor.init(meta)?;
        Ok(adaptor)
    }

    /// Sending and Receiving. Returns only after `writer` is dropped.
    async fn exchange<W: ResponseWriter>(
        &self,
        request_id: Uuid,
        adaptor: &dyn Adaptor,
        meta: &RelayMeta,
        normalized: &NormalizedRequest,
        raw: &Bytes,
        writer: W,
    ) -> Result<(ResponseOutcome, CapturedResponse)> {
        let body = build_request_body(adaptor, meta, normalized, raw)?;
        tracing::info!(
            target: "relay::audit",
            %request_id,
            timestamp = %audit_timestamp(),
            "Final request body: <requestBody> {}</requestBody>",
            String::from_utf8_lossy(&body)
        );

        let response = adaptor.do_request(meta, body).await.map_err(|e| {
            tracing::error!(%request_id, phase = %RelayPhase::Sending, adaptor = adaptor.name(), "DoRequest failed: {}", e);
            e
        })?;

        if is_error_happened(meta, &response) {
            let error = upstream_error(response).await;
            tracing::warn!(%request_id, phase = %RelayPhase::Receiving, "Upstream returned an error: {}", error);
            return Err(error);
        }

        let tap = ResponseTap::new(writer, meta.is_stream);
        let outcome = adaptor.do_response(meta, response, &tap).await;
        let (writer, captured) = tap.into_parts();
        let head_written = writer.head_written();
        // Ends the client response before extraction and settlement
        drop(writer);

        match outcome {
            Ok(outcome) => Ok((outcome, captured)),
            Err(e) => {
                if head_written {
                    tracing::error!(
                        %request_id,
                        phase = %RelayPhase::Receiving,
                        bytes_sent = captured.body.len(),
                        "Response failed after bytes reached the client: {}",
                        e
                    );
                } else {
                    tracing::error!(%request_id, phase = %RelayPhase::Receiving, "DoResponse failed: {}", e);
                }
                Err(e)
            },
        }
    }

    async fn rollback(
        &self,
        request_id: Uuid,
        reservation: QuotaReservation,
        error: RelayError,
    ) -> RelayError {
        tracing::info!(%request_id, phase = %RelayPhase::Rollback, reservation = %reservation, "Returning pre-consumed quota");

        if let Err(e) = self.ledger.release(reservation).await {
            tracing::error!(target: "relay::audit", %request_id, "Failed to return pre-consumed quota: {}", e);
        }
        self.stats.record_error(true);
        error
    }

    /// Backend-reported usage, or a count of the prompt and the response text.
    fn resolve_usage(&self, meta: &RelayMeta, outcome: &ResponseOutcome) -> Usage {
        match outcome.reported {
            Some(reported) if !reported.is_empty() => {
                Usage::new(reported.prompt_tokens, reported.completion_tokens)
            },
            _ => {
                let completion = self
                    .counter
                    .count_text(&outcome.completion_text, &meta.actual_model);
                Usage::new(meta.prompt_tokens, completion)
            },
        }
    }
}

fn audit_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
