// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use region_ipc_client::cfg::config::ClientConfig;

#[test]
fn loads_overrides_from_a_yaml_file_on_disk() {
    let path = std::env::temp_dir()
        .join(format!("region-ipc-client-test-config-{}.yaml", std::process::id()));
    std::fs::write(
        &path,
        "ipc.client.connection.maxidletime: 2500\n\
         ipc.client.connect.max.retries: 2\n\
         ipc.client.tcpnodelay: true\n\
         ipc.ping.interval: 5000\n",
    )
    .unwrap();

    let cfg = ClientConfig::load_from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(cfg.max_idle_time, Duration::from_millis(2500));
    assert_eq!(cfg.max_retries, 2);
    assert!(cfg.tcp_nodelay);
    assert_eq!(cfg.ping_interval, Duration::from_millis(5000));
}

#[test]
fn rejects_a_zero_idle_window() {
    let path = std::env::temp_dir().join(format!(
        "region-ipc-client-test-config-bad-{}.yaml",
        std::process::id()
    ));
    std::fs::write(&path, "ipc.client.connection.maxidletime: 0\n").unwrap();

    let result = ClientConfig::load_from_file(&path);
    std::fs::remove_file(&path).ok();

    assert!(result.is_err());
}
