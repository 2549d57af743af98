use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::engine::NodeId;

/// Timing of one task that actually ran on a worker.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub name: String,
    pub start: Instant,
    pub duration: Duration,
}

/// What happened during one computation. Tasks that were memoized, or that
/// were failed because of an upstream failure, never ran and are not listed.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub execution_times: HashMap<NodeId, TaskExecution>,
}

impl Diagnostics {
    /// Number of tasks that ran.
    pub fn len(&self) -> usize {
        self.execution_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.execution_times.is_empty()
    }

    /// Wall-clock span from the first task starting to the last one ending.
    pub fn wall_time(&self) -> Duration {
        let start = self.execution_times.values().map(|t| t.start).min();
        let end = self
            .execution_times
            .values()
            .map(|t| t.start + t.duration)
            .max();

        match (start, end) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Sum of the time spent inside tasks, across all workers.
    pub fn busy_time(&self) -> Duration {
        self.execution_times.values().map(|t| t.duration).sum()
    }

    /// The `n` longest running tasks, longest first.
    pub fn slowest(&self, n: usize) -> Vec<&TaskExecution> {
        let mut tasks: Vec<_> = self.execution_times.values().collect();
        tasks.sort_by(|a, b| b.duration.cmp(&a.duration));
        tasks.truncate(n);
        tasks
    }

    /// Renders the computation as an SVG waterfall chart, one row per task
    /// sorted by start time.
    pub fn render_waterfall(&self) -> String {
        let mut output = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_waterfall(&mut output);
        output
    }

    pub fn render_waterfall_to_file(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), std::io::Error> {
        std::fs::write(path, self.render_waterfall())
    }

    fn write_waterfall(&self, output: &mut String) -> std::fmt::Result {
        let mut ran_tasks: Vec<&TaskExecution> = self.execution_times.values().collect();

        let Some(global_start) = ran_tasks.iter().map(|t| t.start).min() else {
            output.push_str(r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#);
            return Ok(());
        };

        ran_tasks.sort_by_key(|t| t.start);

        let total_micros = self.wall_time().as_micros().max(1) as f64;

        let row_height = 30;
        let label_width = 300;
        let chart_width = 800;
        let padding = 10;
        let header_height = 30;
        let text_space = 80;

        let width = label_width + chart_width + (padding * 3) + text_space;
        let height = header_height + (ran_tasks.len() as u32 * row_height) + padding;

        write!(
            output,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg">
    <style>
        .task-row:nth-child(even) {{ fill: #f9f9f9; }}
        .task-row:nth-child(odd) {{ fill: #ffffff; }}
        text {{ font-family: sans-serif; font-size: 12px; }}
        .bar {{ fill: #3b82f6; rx: 4; }}
        .label {{ fill: #333; }}
        .time {{ fill: #666; font-size: 11px; }}
        .grid-line {{ stroke: #e5e7eb; stroke-width: 1; }}
        .axis-label {{ fill: #9ca3af; font-size: 10px; }}
    </style>
    <rect width="100%" height="100%" fill="white" />
"#
        )?;

        for i in 0..=5 {
            let pct = i as f64 / 5.0;
            let x = label_width as f64 + padding as f64 + (chart_width as f64 * pct);
            writeln!(
                output,
                r#"    <line x1="{x}" y1="{header_height}" x2="{x}" y2="{height}" class="grid-line" />
    <text x="{x}" y="{y}" text-anchor="middle" class="axis-label">{label}</text>"#,
                y = header_height - 5,
                label = micros(total_micros * pct),
            )?;
        }

        for (i, exec) in ran_tasks.iter().enumerate() {
            let name = escape(&exec.name);
            let y_pos = header_height + (i as u32 * row_height);

            let offset_micros = exec.start.duration_since(global_start).as_micros() as f64;
            let duration_micros = exec.duration.as_micros() as f64;

            let bar_x = label_width as f64
                + padding as f64
                + (offset_micros / total_micros * chart_width as f64);
            let bar_width = (duration_micros / total_micros * chart_width as f64).max(1.0);

            writeln!(
                output,
                r#"    <rect x="0" y="{y_pos}" width="{width}" height="{row_height}" class="task-row" />
    <text x="{padding}" y="{mid}" class="label" dominant-baseline="middle">{name}</text>
    <rect x="{bar_x}" y="{bar_y}" width="{bar_width}" height="{bar_height}" class="bar"><title>{name}: {dur:.2?}</title></rect>
    <text x="{text_x}" y="{mid}" class="time" dominant-baseline="middle">{label}</text>"#,
                mid = y_pos + row_height / 2,
                bar_y = y_pos + 5,
                bar_height = row_height - 10,
                dur = exec.duration,
                text_x = bar_x + bar_width + 5.0,
                label = micros(duration_micros),
            )?;
        }

        output.push_str("</svg>");
        Ok(())
    }
}

fn micros(value: f64) -> String {
    if value < 1000.0 {
        format!("{value:.0}µs")
    } else {
        format!("{:.2}ms", value / 1000.0)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use petgraph::graph::NodeIndex;

    use super::*;
    use crate::core::GraphId;

    fn sample() -> Diagnostics {
        let graph = GraphId::next();
        let start = Instant::now();
        let mut execution_times = HashMap::new();

        let tasks = [("load", 0, 5), ("clean<f64>", 5, 20), ("save", 25, 2)];

        for (i, (name, offset, duration)) in tasks.into_iter().enumerate() {
            execution_times.insert(
                NodeId::new(graph, NodeIndex::new(i)),
                TaskExecution {
                    name: name.to_string(),
                    start: start + Duration::from_millis(offset),
                    duration: Duration::from_millis(duration),
                },
            );
        }

        Diagnostics { execution_times }
    }

    #[test]
    fn test_times() {
        let diagnostics = sample();
        assert_eq!(diagnostics.wall_time(), Duration::from_millis(27));
        assert_eq!(diagnostics.busy_time(), Duration::from_millis(27));

        let slowest = diagnostics.slowest(1);
        assert_eq!(slowest.len(), 1);
        assert_eq!(slowest[0].name, "clean<f64>");
    }

    #[test]
    fn test_waterfall() {
        let svg = sample().render_waterfall();
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("clean&lt;f64&gt;"));
        assert_eq!(svg.matches("class=\"bar\"").count(), 3);
    }

    #[test]
    fn test_empty_waterfall() {
        let diagnostics = Diagnostics::default();
        assert_eq!(diagnostics.wall_time(), Duration::ZERO);
        assert!(diagnostics.render_waterfall().contains("No tasks ran"));
    }
}
