// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Example: share one contiguous block between a cached CPU view and a
//! non-cached "device" view on the host emulation.
//!
//! Pass a TOML layout to override the default 64 MB partition.
//!
//! ```bash
//! RUST_LOG=debug cargo run -p cmm --example cache_coherency [layout.toml]
//! ```

use anyhow::Context;
use cmm::{CacheMode, ErrorKind, System};
use cmm_sys::{HostBackend, HostConfig};
use std::path::Path;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => HostConfig::from_file(Path::new(&path))
            .with_context(|| format!("loading layout from {path}"))?,
        None => HostConfig::default(),
    };
    let host = Arc::new(HostBackend::new(config).context("creating host backend")?);
    let system = System::init(host.clone())?;

    for p in cmm::query_partitions(system.backend().as_ref())? {
        println!("partition {:<12} {:#x} {} KB", p.name, p.phys, p.size_kb);
    }

    let buffer = system.buffer();
    let mut cpu = buffer.allocate(0x10_0000, CacheMode::Cached, "frame")?;
    let device = buffer.map_view(0, 0x10_0000, CacheMode::NonCached)?;

    cpu.fill(0x42);
    println!("before flush: device sees {:#04x}", device.to_vec()[0]);
    cpu.flush()?;
    println!("after flush:  device sees {:#04x}", device.to_vec()[0]);

    match buffer.free() {
        Err(e) if e.is(ErrorKind::ReferencesRemain) => println!("free refused: {e}"),
        other => other?,
    }

    print!("{}", buffer.dump(0x80));
    println!("verify: {}", buffer.verify());

    drop((cpu, device));
    buffer.free()?;

    let status = cmm::query_status(system.backend().as_ref())?;
    println!(
        "in use: {} of {} bytes, {} block(s)",
        status.used_size(),
        status.total_size,
        status.block_count
    );
    println!("{}", host.stats().summary());
    Ok(())
}
