use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

use crate::core::models::{AgentStatus, Finding, Screenshot, Severity};
use crate::dashboard::metrics::{AgentCoverage, SeverityCounts};

pub struct TableBuilder {
    table: Table,
}

impl TableBuilder {
    pub fn new() -> Self {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::Dynamic);

        Self { table }
    }

    fn header(&mut self, titles: &[&str]) {
        self.table.set_header(
            titles
                .iter()
                .map(|t| Cell::new(t).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
    }

    pub fn coverage(rows: &[AgentCoverage]) -> String {
        let mut builder = Self::new();
        builder.header(&["Agent", "Status", "Progress", "Requests", "Findings", "Worst", "Events"]);

        for row in rows {
            let requests = if row.budget > 0 {
                format!("{}/{}", row.requests_used, row.budget)
            } else {
                row.requests_used.to_string()
            };
            let mut requests_cell = Cell::new(requests).set_alignment(CellAlignment::Right);
            if row.requests_used > row.budget && row.budget > 0 {
                requests_cell = requests_cell.fg(Color::Red);
            }
            let events = match row.screenshot_count {
                0 => row.event_count.to_string(),
                shots => format!("{} ({} shots)", row.event_count, shots),
            };

            builder.table.add_row(vec![
                Cell::new(row.agent.label()),
                Cell::new(row.status.as_str()).fg(status_color(row.status)),
                Cell::new(format!("{:>3}%", row.progress)).set_alignment(CellAlignment::Right),
                requests_cell,
                Cell::new(row.finding_count).set_alignment(CellAlignment::Right),
                match row.worst {
                    Some(s) => Cell::new(s.as_str()).fg(severity_color(s)),
                    None => Cell::new("-").fg(Color::DarkGrey),
                },
                Cell::new(events).set_alignment(CellAlignment::Right),
            ]);
        }

        builder.table.to_string()
    }

    pub fn severity_counts(counts: &SeverityCounts) -> String {
        let mut builder = Self::new();
        builder.header(&["Severity", "Count", "Weight"]);

        for severity in Severity::DESCENDING {
            builder.table.add_row(vec![
                Cell::new(severity.as_str()).fg(severity_color(severity)),
                Cell::new(counts.get(severity)).set_alignment(CellAlignment::Right),
                Cell::new(severity.weight()).set_alignment(CellAlignment::Right),
            ]);
        }
        builder.table.add_row(vec![
            Cell::new("Total").add_attribute(Attribute::Bold),
            Cell::new(counts.total()).set_alignment(CellAlignment::Right),
            Cell::new(counts.weighted()).set_alignment(CellAlignment::Right),
        ]);

        builder.table.to_string()
    }

    pub fn findings(findings: &[&Finding]) -> String {
        let mut builder = Self::new();
        builder.header(&["Severity", "Agent", "Title", "Found"]);

        for finding in findings {
            builder.table.add_row(vec![
                Cell::new(finding.severity.as_str()).fg(severity_color(finding.severity)),
                Cell::new(finding.agent_type.label()),
                Cell::new(&finding.title),
                Cell::new(finding.created_at.format("%H:%M:%S").to_string()),
            ]);
        }

        builder.table.to_string()
    }

    pub fn screenshots(shots: &[Screenshot]) -> String {
        let mut builder = Self::new();
        builder.header(&["#", "Caption", "URL", "Taken", "Highlight"]);

        for (i, shot) in shots.iter().enumerate() {
            let highlight = match &shot.highlight {
                Some(h) => format!("{:.0}x{:.0} at ({:.0}, {:.0})", h.width, h.height, h.x, h.y),
                None => "-".to_string(),
            };
            builder.table.add_row(vec![
                Cell::new(i + 1).set_alignment(CellAlignment::Right),
                Cell::new(if shot.caption.is_empty() { "-" } else { shot.caption.as_str() }),
                Cell::new(&shot.url).fg(Color::Cyan),
                Cell::new(&shot.timestamp),
                Cell::new(highlight),
            ]);
        }

        builder.table.to_string()
    }
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn status_color(status: AgentStatus) -> Color {
    match status {
        AgentStatus::Pending | AgentStatus::Queued => Color::DarkGrey,
        AgentStatus::Running => Color::Cyan,
        AgentStatus::Completed => Color::Green,
        AgentStatus::Failed => Color::Red,
        AgentStatus::Cancelled => Color::Yellow,
    }
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Critical => Color::Magenta,
        Severity::High => Color::Red,
        Severity::Medium => Color::Yellow,
        Severity::Low => Color::Blue,
        Severity::Info => Color::DarkGrey,
    }
}
