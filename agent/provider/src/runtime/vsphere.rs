/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! vSphere family: fault type classification and capabilities.

use super::{Fault, NativeError};
use common::capability::{Capability, CapabilitySet};
use common::error::{ErrorKind, ProviderError};

pub fn classify(fault: &str, message: &str) -> ProviderError {
    let kind = match fault {
        "ManagedObjectNotFound" | "NotFound" | "FileNotFound" => ErrorKind::NotFound,
        "DuplicateName" | "AlreadyExists" | "FileAlreadyExists" => ErrorKind::AlreadyExists,
        "HostNotConnected"
        | "HostCommunication"
        | "HostNotReachable"
        | "NotAuthenticated"
        | "TaskInProgress"
        | "ResourceInUse"
        | "ToolsUnavailable" => ErrorKind::Unavailable,
        "InvalidArgument"
        | "InvalidPowerState"
        | "InvalidState"
        | "InvalidDeviceSpec"
        | "InvalidName"
        | "InsufficientResourcesFault" => ErrorKind::InvalidArgument,
        "NotSupported" | "NotImplemented" | "SnapshotDisabled" => ErrorKind::Unimplemented,
        "RequestCanceled" => ErrorKind::Canceled,
        _ => ErrorKind::Internal,
    };
    ProviderError::new(kind, format!("vSphere {fault}: {message}"))
}

pub(super) fn native(fault: Fault, message: String) -> NativeError {
    let fault = match fault {
        Fault::NoSuchVm => "ManagedObjectNotFound",
        Fault::NoSuchSnapshot => "NotFound",
        Fault::Duplicate => "DuplicateName",
        Fault::InvalidRequest => "InvalidPowerState",
        Fault::Unsupported => "NotSupported",
        Fault::Aborted => "RequestCanceled",
        Fault::Busy => "TaskInProgress",
        Fault::HostDown => "HostNotConnected",
        Fault::Crash => "SystemError",
    };
    NativeError::Vsphere {
        fault: fault.to_string(),
        message,
    }
}

pub fn default_capabilities() -> CapabilitySet {
    Capability::ALL.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_faults() {
        assert_eq!(classify("ManagedObjectNotFound", "vm-42").kind, ErrorKind::NotFound);
        assert_eq!(classify("DuplicateName", "web").kind, ErrorKind::AlreadyExists);
        assert_eq!(classify("HostNotConnected", "esx1").kind, ErrorKind::Unavailable);
        assert_eq!(classify("InvalidPowerState", "off").kind, ErrorKind::InvalidArgument);
        assert_eq!(classify("NotSupported", "").kind, ErrorKind::Unimplemented);
        assert_eq!(classify("RequestCanceled", "").kind, ErrorKind::Canceled);
        assert_eq!(classify("RuntimeFault", "").kind, ErrorKind::Internal);
    }
}
