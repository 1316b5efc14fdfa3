/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! gatedns: a DNS-over-HTTPS proxy with a configurable plugin pipeline.
//!
//! Requests enter through the DoH boundary, flow through an ordered,
//! conditional plugin chain (cache, policy matchers, static hosts,
//! forwarders), and leave as DNS responses.

pub mod codec;
pub mod config;
pub mod core;
pub mod loader;
pub mod plugin;
pub mod server;
