fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_secs_env(name: &str, default: i64) -> i64 {
    let fallback = u64::try_from(default).unwrap_or(1);
    i64::try_from(read_u64_env(name, fallback)).unwrap_or(i64::MAX)
}

fn read_optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn url_check(value: &str) -> anyhow::Result<()> {
    IngestClient::with_base_url(value)
        .map(|_| ())
        .with_context(|| format!("MAILSYNC_INGEST_URL is not a valid url: {value}"))
}

/// A configured command line wins over a systemd unit.
fn build_terminator(config: &DaemonConfig) -> anyhow::Result<Option<Arc<dyn ForceTerminate>>> {
    if let Some(command) = config.force_terminate_cmd.as_deref() {
        let terminator = CommandTerminator::from_command_line(command)
            .context("invalid MAILSYNC_FORCE_TERMINATE_CMD")?;
        return Ok(Some(Arc::new(terminator)));
    }
    Ok(config
        .service_unit
        .as_deref()
        .map(|unit| Arc::new(CommandTerminator::systemd_restart(unit)) as Arc<dyn ForceTerminate>))
}

fn history_cutoff(now: i64, days: u64) -> i64 {
    let days = i64::try_from(days).unwrap_or(i64::MAX);
    now.saturating_sub(days.saturating_mul(86_400))
}

fn status_changed(previous: Option<&UnifiedStatus>, next: &UnifiedStatus) -> bool {
    match previous {
        None => true,
        Some(previous) => {
            previous.status != next.status
                || previous.source != next.source
                || previous.session_id != next.session_id
        }
    }
}
