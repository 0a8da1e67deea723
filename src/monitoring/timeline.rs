//! Execution Timeline
//!
//! Tracks call attempt start/end times for run reports and Gantt charts.
//! Events are keyed by call key (`fqn:index:attempt`), so every retry gets
//! its own bar.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Attempt started
    Started,
    /// Attempt finished with outputs
    Completed,
    Failed,
    Aborted,
    /// Attempt failed and will be retried
    Retried,
}

impl EventType {
    fn ends_attempt(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Call key the event belongs to
    pub call: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
    end_time: Option<Instant>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
            end_time: None,
        }
    }

    /// Records an event for a call attempt.
    pub fn add_event(&mut self, call: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            call: call.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Freezes the end of the timeline once the run is over.
    pub fn finish(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Instant::now());
        }
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time from creation to `finish`, or to now for a running workflow.
    pub fn elapsed(&self) -> Duration {
        self.end_time
            .unwrap_or_else(Instant::now)
            .duration_since(self.start_time)
    }

    /// (start, end) in milliseconds since creation, per call key.
    fn spans(&self) -> Vec<(String, u128, Option<u128>)> {
        let mut order: Vec<String> = Vec::new();
        let mut spans: HashMap<String, (u128, Option<u128>)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();

            if event.event_type.ends_attempt() {
                if let Some(span) = spans.get_mut(&event.call) {
                    span.1 = Some(elapsed);
                }
            } else if !spans.contains_key(&event.call) {
                order.push(event.call.clone());
                spans.insert(event.call.clone(), (elapsed, None));
            }
        }

        order
            .into_iter()
            .filter_map(|call| spans.remove(&call).map(|(start, end)| (call, start, end)))
            .collect()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each attempt is shown as a bar indicating when it ran relative to
    /// the total run time. Attempts still running extend to the end.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (call, start, end) in self.spans() {
            let end = end.unwrap_or(total_time);
            let start_pos = (start as f64 * scale) as usize;
            let duration = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(duration));

            output.push_str(&format!(
                "{} |{:50}| ({} ms)\n",
                truncate(&call, 24),
                bar,
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Durations in milliseconds of every finished attempt.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(call, start, end)| end.map(|end| (call, end - start)))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.events.is_empty());
        assert!(timeline.end_time.is_none());
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("wf.a:NA:1", EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event("wf.a:NA:1", EventType::Completed);

        let durations = timeline.get_durations();
        assert!(*durations.get("wf.a:NA:1").unwrap() >= 50);
    }

    #[test]
    fn test_retried_attempts_get_their_own_span() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("wf.a:NA:1", EventType::Started);
        timeline.add_event("wf.a:NA:1", EventType::Retried);
        timeline.add_event("wf.a:NA:2", EventType::Started);
        timeline.add_event("wf.a:NA:2", EventType::Aborted);

        let durations = timeline.get_durations();
        assert_eq!(durations.len(), 2);
        assert_eq!(timeline.get_events()[3].event_type, EventType::Aborted);
    }

    #[test]
    fn test_get_durations_only_started() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("wf.a:NA:1", EventType::Started);

        let durations = timeline.get_durations();
        assert!(!durations.contains_key("wf.a:NA:1"));
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let mut timeline = ExecutionTimeline::new();
        thread::sleep(Duration::from_millis(20));
        timeline.finish();
        let frozen = timeline.elapsed();
        thread::sleep(Duration::from_millis(20));

        assert_eq!(timeline.elapsed(), frozen);
        assert!(frozen.as_millis() >= 20);
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();

        timeline.add_event("wf.align:0:1", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("wf.align:0:1", EventType::Completed);
        timeline.add_event("wf.merge:NA:1", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("wf.merge:NA:1", EventType::Failed);
        timeline.finish();

        let chart = timeline.gantt_chart();
        assert!(chart.contains("wf.align:0:1"));
        assert!(chart.contains("wf.merge:NA:1"));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.gantt_chart().contains("Timeline"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("abcdefgh", 6), "abc...");
    }
}
