/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! KVM/libvirt family: virErrorNumber classification and capabilities.

use super::{Fault, NativeError};
use common::capability::{Capability, CapabilitySet};
use common::error::{ErrorKind, ProviderError};

pub const VIR_ERR_INTERNAL_ERROR: i32 = 1;
pub const VIR_ERR_NO_SUPPORT: i32 = 3;
pub const VIR_ERR_NO_CONNECT: i32 = 5;
pub const VIR_ERR_INVALID_ARG: i32 = 8;
pub const VIR_ERR_OPERATION_FAILED: i32 = 9;
pub const VIR_ERR_XML_ERROR: i32 = 27;
pub const VIR_ERR_DOM_EXIST: i32 = 28;
pub const VIR_ERR_SYSTEM_ERROR: i32 = 38;
pub const VIR_ERR_RPC: i32 = 39;
pub const VIR_ERR_NO_DOMAIN: i32 = 42;
pub const VIR_ERR_OPERATION_INVALID: i32 = 55;
pub const VIR_ERR_CONFIG_UNSUPPORTED: i32 = 67;
pub const VIR_ERR_OPERATION_TIMEOUT: i32 = 68;
pub const VIR_ERR_NO_DOMAIN_SNAPSHOT: i32 = 72;
pub const VIR_ERR_OPERATION_ABORTED: i32 = 78;
pub const VIR_ERR_OPERATION_UNSUPPORTED: i32 = 84;
pub const VIR_ERR_AGENT_UNRESPONSIVE: i32 = 86;

pub fn classify(code: i32, message: &str) -> ProviderError {
    let kind = match code {
        VIR_ERR_NO_DOMAIN | VIR_ERR_NO_DOMAIN_SNAPSHOT => ErrorKind::NotFound,
        VIR_ERR_DOM_EXIST => ErrorKind::AlreadyExists,
        VIR_ERR_NO_CONNECT
        | VIR_ERR_RPC
        | VIR_ERR_OPERATION_TIMEOUT
        | VIR_ERR_AGENT_UNRESPONSIVE => ErrorKind::Unavailable,
        VIR_ERR_INVALID_ARG | VIR_ERR_XML_ERROR | VIR_ERR_OPERATION_INVALID => {
            ErrorKind::InvalidArgument
        }
        VIR_ERR_NO_SUPPORT | VIR_ERR_CONFIG_UNSUPPORTED | VIR_ERR_OPERATION_UNSUPPORTED => {
            ErrorKind::Unimplemented
        }
        VIR_ERR_OPERATION_ABORTED => ErrorKind::Canceled,
        _ => ErrorKind::Internal,
    };
    ProviderError::new(kind, format!("libvirt error {code}: {message}"))
}

pub(super) fn native(fault: Fault, message: String) -> NativeError {
    let code = match fault {
        Fault::NoSuchVm => VIR_ERR_NO_DOMAIN,
        Fault::NoSuchSnapshot => VIR_ERR_NO_DOMAIN_SNAPSHOT,
        Fault::Duplicate => VIR_ERR_DOM_EXIST,
        Fault::InvalidRequest => VIR_ERR_OPERATION_INVALID,
        Fault::Unsupported => VIR_ERR_OPERATION_UNSUPPORTED,
        Fault::Aborted => VIR_ERR_OPERATION_ABORTED,
        Fault::Busy => VIR_ERR_AGENT_UNRESPONSIVE,
        Fault::HostDown => VIR_ERR_NO_CONNECT,
        Fault::Crash => VIR_ERR_INTERNAL_ERROR,
    };
    NativeError::Libvirt { code, message }
}

pub fn default_capabilities() -> CapabilitySet {
    Capability::ALL.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_codes() {
        assert_eq!(classify(VIR_ERR_NO_DOMAIN, "Domain not found").kind, ErrorKind::NotFound);
        assert_eq!(classify(VIR_ERR_DOM_EXIST, "exists").kind, ErrorKind::AlreadyExists);
        assert_eq!(classify(VIR_ERR_RPC, "eof").kind, ErrorKind::Unavailable);
        assert_eq!(classify(VIR_ERR_XML_ERROR, "bad xml").kind, ErrorKind::InvalidArgument);
        assert_eq!(classify(VIR_ERR_SYSTEM_ERROR, "io").kind, ErrorKind::Internal);
        assert_eq!(classify(VIR_ERR_OPERATION_FAILED, "?").kind, ErrorKind::Internal);
    }

    #[test]
    fn test_unknown_code_is_internal() {
        let err = classify(9999, "new in libvirt 11");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("9999"));
    }

    #[test]
    fn test_full_capabilities() {
        let caps = default_capabilities();
        assert!(caps.supports(Capability::OnlineReconfigure));
        assert!(caps.supports(Capability::GuestAgent));
    }
}
