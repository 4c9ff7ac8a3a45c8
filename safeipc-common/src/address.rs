// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Local server address. The two integers are opaque to the transport;
/// deployments partition them however they like (the convention is one
/// domain per application, one port per server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct UnicastAddress {
    pub domain: u32,
    pub port: u32,
}

impl UnicastAddress {
    pub fn new(domain: u32, port: u32) -> Self {
        Self { domain, port }
    }

    /// Filesystem path the server socket for this address is bound at.
    pub fn socket_path(&self, runtime_dir: &Path) -> PathBuf {
        runtime_dir.join(format!("safeipc-{}-{}.socket", self.domain, self.port))
    }
}
