use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Waits until the condition holds, panicking if it does not hold in time.
///
/// For state that changes on another task, such as the router's view of a session.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let result = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition did not hold within {WAIT_TIMEOUT:?}");
}
