/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Proxmox VE family: API status classification and capabilities.
//!
//! PVE reports most task failures as HTTP 500 with a text reason, so the
//! classifier looks at the reason text for that status only.

use super::{Fault, NativeError};
use common::capability::{Capability, CapabilitySet};
use common::error::{ErrorKind, ProviderError};

/// PVE proxy status for a cluster node it cannot reach.
pub const STATUS_NO_ROUTE: u16 = 595;

pub fn classify(status: u16, message: &str) -> ProviderError {
    let kind = match status {
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        400 | 422 => ErrorKind::InvalidArgument,
        501 => ErrorKind::Unimplemented,
        401 | 403 | 408 | 429 | 502 | 503 | 504 | STATUS_NO_ROUTE => ErrorKind::Unavailable,
        500 => classify_reason(message),
        _ => ErrorKind::Internal,
    };
    ProviderError::new(kind, format!("proxmox {status}: {message}"))
}

fn classify_reason(message: &str) -> ErrorKind {
    let reason = message.to_ascii_lowercase();
    if reason.contains("does not exist") || reason.contains("no such") {
        ErrorKind::NotFound
    } else if reason.contains("already exists") {
        ErrorKind::AlreadyExists
    } else if reason.contains("interrupted by signal") {
        ErrorKind::Canceled
    } else if reason.contains("can't lock file") || reason.contains("got timeout") {
        ErrorKind::Unavailable
    } else {
        ErrorKind::Internal
    }
}

pub(super) fn native(fault: Fault, message: String) -> NativeError {
    let (status, message) = match fault {
        Fault::NoSuchVm => (500, format!("VM {message} does not exist")),
        Fault::NoSuchSnapshot => (500, format!("snapshot '{message}' does not exist")),
        Fault::Duplicate => (500, format!("VM {message} already exists")),
        Fault::InvalidRequest => (400, message),
        Fault::Unsupported => (501, message),
        Fault::Aborted => (500, format!("{message}: interrupted by signal")),
        Fault::Busy => (500, format!("can't lock file '/var/lock/qemu-server/{message}.conf' - got timeout")),
        Fault::HostDown => (STATUS_NO_ROUTE, message),
        Fault::Crash => (500, message),
    };
    NativeError::Proxmox { status, message }
}

/// PVE cannot hot-plug every device class, so online reconfigure is off.
pub fn default_capabilities() -> CapabilitySet {
    Capability::ALL
        .iter()
        .copied()
        .filter(|c| *c != Capability::OnlineReconfigure)
        .collect()
}
