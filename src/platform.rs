/// Service descriptor for running the collector under the host's supervisor.
pub fn platform_template() -> &'static str {
    #[cfg(windows)]
    const TEMPLATE: &str = r#"[Service]
ExecStart=deauth-collector.exe --config C:\etc\deauth-collector\deauth-collector.toml
Restart=always
"#;

    #[cfg(not(windows))]
    const TEMPLATE: &str = r#"[Unit]
Description=WiFi deauthentication event collector
After=dev-serial0.device
BindsTo=dev-serial0.device

[Service]
ExecStart=/usr/local/bin/deauth-collector --config /etc/deauth-collector/deauth-collector.toml
Restart=on-failure
KillSignal=SIGTERM

[Install]
WantedBy=multi-user.target
"#;

    TEMPLATE
}

pub fn log_platform_guidance() {
    tracing::debug!(
        template = platform_template(),
        "service unit for this host"
    );
}
