// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Everything between a canonical message list and a provider's HTTP API:
//! the message model, per-provider adaptation and clients, heuristic
//! routing, the response cache, usage metering with a hard cost cap, and
//! the [`gateway::LlmGateway`] that ties them together with fallback.

pub mod adapter;
pub mod anthropic;
pub mod cache;
pub mod catalog;
pub mod error;
pub mod gateway;
pub mod google;
pub mod http;
pub mod openai_compat;
pub mod provider;
pub mod router;
pub mod types;
pub mod usage;

pub use adapter::{adapt, adapt_tools, strip_internal_keys, Adapted, WireFormat};
pub use error::{scrub_secrets, LlmError};
pub use gateway::{CallOptions, GatewayOptions, LlmGateway, MetricsSnapshot};
pub use provider::{split_model, EventStream, ProviderClient, ProviderRequest};
pub use router::ModelRouter;
pub use types::{
    CallFailure, ContentBlock, ImageSource, LlmResult, Message, MessageContent, Role,
    StreamEvent, ThinkingLevel, ToolCallRequest, ToolSchema, Usage,
};
pub use usage::{CostCapExceeded, PeriodUsage, UsageMeter, UsageRecord, UsageTotals};
