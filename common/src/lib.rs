/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Shared building blocks for the VM control plane.
//!
//! Both the reconciliation controller and every provider server link this
//! crate. It owns the wire contract (`provider`), the error taxonomy both
//! sides agree on (`error`), the declarative VM resource model (`spec`), and
//! the ambient pieces each process needs at startup: settings, logging and
//! the health endpoint.

pub mod capability;
pub mod error;
pub mod health;
pub mod logd;
pub mod provider;
pub mod setting;
pub mod spec;
pub mod task;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
