#![forbid(unsafe_code)]

// Viewer tracking - per-room HLS viewer counts with delayed auto-stop

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

struct ViewerEntry {
    count: usize,
    last_activity: Instant,
    auto_stop: Option<JoinHandle<()>>,
}

impl ViewerEntry {
    fn new() -> Self {
        Self {
            count: 0,
            last_activity: Instant::now(),
            auto_stop: None,
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.auto_stop.take() {
            timer.abort();
        }
    }
}

/// Counts HLS viewers per room.
///
/// When a room's count reaches zero a timer is armed; if nobody comes back
/// before it fires, the room code is sent on the stop channel. The receiver
/// must re-check the count before acting, since a join may race the timer.
pub struct ViewerTracker {
    entries: StdMutex<HashMap<String, ViewerEntry>>,
    auto_stop_delay: Duration,
    idle_timeout: Duration,
    stop_requests: mpsc::UnboundedSender<String>,
}

impl ViewerTracker {
    pub fn new(
        auto_stop_delay: Duration,
        idle_timeout: Duration,
        stop_requests: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            auto_stop_delay,
            idle_timeout,
            stop_requests,
        }
    }

    /// Returns the new count and cancels any pending auto-stop.
    pub fn add_viewer(&self, room_code: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(room_code.to_string())
            .or_insert_with(ViewerEntry::new);
        entry.count += 1;
        entry.last_activity = Instant::now();
        entry.disarm();
        debug!("Viewer joined room {} ({} watching)", room_code, entry.count);
        entry.count
    }

    /// Returns the new count, floored at zero. Arms auto-stop on reaching zero.
    pub fn remove_viewer(&self, room_code: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(room_code) else {
            return 0;
        };
        if entry.count == 0 {
            return 0;
        }
        entry.count -= 1;
        debug!("Viewer left room {} ({} watching)", room_code, entry.count);
        if entry.count == 0 {
            self.arm(room_code, entry);
        }
        entry.count
    }

    /// Refresh the activity timestamp, e.g. on a playlist or segment fetch.
    /// A room seen at zero viewers is bumped to one.
    pub fn record_activity(&self, room_code: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(room_code.to_string())
            .or_insert_with(ViewerEntry::new);
        entry.last_activity = Instant::now();
        if entry.count == 0 {
            entry.count = 1;
            entry.disarm();
        }
        entry.count
    }

    pub fn count(&self, room_code: &str) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(room_code).map_or(0, |entry| entry.count)
    }

    pub fn auto_stop_armed(&self, room_code: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(room_code)
            .map_or(false, |entry| entry.auto_stop.is_some())
    }

    /// Reset rooms with viewers but no activity for the idle timeout to zero.
    /// Auto-stop is armed for those that are still streaming. Rooms left at
    /// zero with no transcode session are dropped. Returns the reset codes.
    pub fn sweep_idle(
        &self,
        is_streaming: impl Fn(&str) -> bool,
        has_session: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut reset = Vec::new();
        for (code, entry) in entries.iter_mut() {
            if entry.count > 0 && now.duration_since(entry.last_activity) > self.idle_timeout {
                info!(
                    "No viewer activity in room {} for {:?}, resetting count from {}",
                    code, self.idle_timeout, entry.count
                );
                entry.count = 0;
                if is_streaming(code) {
                    self.arm(code, entry);
                }
                reset.push(code.clone());
            }
        }
        entries.retain(|code, entry| {
            if entry.count > 0 || has_session(code) {
                return true;
            }
            entry.disarm();
            debug!("Dropped viewer state for room {} with no stream", code);
            false
        });
        reset
    }

    /// Rooms with viewer state.
    pub fn tracked(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop all state for a room.
    pub fn forget(&self, room_code: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut entry) = entries.remove(room_code) {
            entry.disarm();
        }
    }

    fn arm(&self, room_code: &str, entry: &mut ViewerEntry) {
        entry.disarm();
        let delay = self.auto_stop_delay;
        let code = room_code.to_string();
        let stop_requests = self.stop_requests.clone();
        debug!("Auto-stop armed for room {} in {:?}", room_code, delay);
        entry.auto_stop = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = stop_requests.send(code);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (ViewerTracker, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ViewerTracker::new(Duration::from_secs(30), Duration::from_secs(60), tx),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_viewer_leaving_arms_auto_stop() {
        let (tracker, mut stops) = tracker();
        assert_eq!(tracker.add_viewer("ABC123"), 1);
        assert_eq!(tracker.add_viewer("ABC123"), 2);
        assert_eq!(tracker.remove_viewer("ABC123"), 1);
        assert!(!tracker.auto_stop_armed("ABC123"));
        assert_eq!(tracker.remove_viewer("ABC123"), 0);
        assert!(tracker.auto_stop_armed("ABC123"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(stops.try_recv().ok().as_deref(), Some("ABC123"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_cancels_auto_stop() {
        let (tracker, mut stops) = tracker();
        tracker.add_viewer("ABC123");
        tracker.remove_viewer("ABC123");
        tokio::time::sleep(Duration::from_secs(10)).await;
        tracker.add_viewer("ABC123");
        assert!(!tracker.auto_stop_armed("ABC123"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(stops.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_floors_at_zero() {
        let (tracker, _stops) = tracker();
        assert_eq!(tracker.remove_viewer("ABC123"), 0);
        tracker.add_viewer("ABC123");
        assert_eq!(tracker.remove_viewer("ABC123"), 0);
        assert_eq!(tracker.remove_viewer("ABC123"), 0);
        assert_eq!(tracker.count("ABC123"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_bumps_zero_to_one() {
        let (tracker, _stops) = tracker();
        tracker.add_viewer("ABC123");
        tracker.remove_viewer("ABC123");
        assert!(tracker.auto_stop_armed("ABC123"));
        assert_eq!(tracker.record_activity("ABC123"), 1);
        assert!(!tracker.auto_stop_armed("ABC123"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_resets_and_arms() {
        let (tracker, mut stops) = tracker();
        tracker.add_viewer("ABC123");
        tracker.add_viewer("XYZ999");

        tokio::time::sleep(Duration::from_secs(45)).await;
        tracker.record_activity("XYZ999");
        tokio::time::sleep(Duration::from_secs(20)).await;

        let reset = tracker.sweep_idle(|_| true, |_| true);
        assert_eq!(reset, vec!["ABC123".to_string()]);
        assert_eq!(tracker.count("ABC123"), 0);
        assert_eq!(tracker.count("XYZ999"), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(stops.try_recv().ok().as_deref(), Some("ABC123"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_drops_rooms_without_session() {
        let (tracker, mut stops) = tracker();
        tracker.add_viewer("LIVE11");
        tracker.remove_viewer("LIVE11");
        tracker.add_viewer("GONE22");
        tracker.remove_viewer("GONE22");
        tracker.add_viewer("WATCH3");
        assert_eq!(tracker.tracked(), 3);

        let reset = tracker.sweep_idle(|_| false, |code| code == "LIVE11");
        assert!(reset.is_empty());
        assert_eq!(tracker.tracked(), 2);
        assert!(tracker.auto_stop_armed("LIVE11"));
        assert!(!tracker.auto_stop_armed("GONE22"));
        assert_eq!(tracker.count("WATCH3"), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(stops.try_recv().ok().as_deref(), Some("LIVE11"));
        assert!(stops.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_cancels_timer() {
        let (tracker, mut stops) = tracker();
        tracker.add_viewer("ABC123");
        tracker.remove_viewer("ABC123");
        tracker.forget("ABC123");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(stops.try_recv().is_err());
        assert_eq!(tracker.count("ABC123"), 0);
    }
}
