use tokio::signal::unix::{signal, SignalKind};
use tracing::warn;

/// Resolves on SIGINT or SIGTERM.
///
/// Handlers are installed on first poll, so until the returned future is
/// awaited both signals keep their default behaviour.
pub async fn shutdown() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; only Ctrl-C interrupts");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal};
    use std::time::Duration;

    #[tokio::test]
    async fn sigterm_resolves_shutdown() {
        // Registered first so an early SIGTERM cannot end the test process.
        let _keep = signal(SignalKind::terminate()).unwrap();
        let mut done = std::pin::pin!(shutdown());
        let resolved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::select! {
                    () = &mut done => break,
                    () = tokio::time::sleep(Duration::from_millis(50)) => {
                        raise(Signal::SIGTERM).unwrap();
                    }
                }
            }
        })
        .await;
        assert!(resolved.is_ok(), "shutdown did not resolve on SIGTERM");
    }
}
