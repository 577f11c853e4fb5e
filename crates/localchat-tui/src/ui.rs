use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, Gauge, List, ListItem, Paragraph},
};
use localchat_core::markup::{self, LineKind};
use localchat_core::{EntryRole, SessionState, TranscriptEntry};
use crate::app::{App, InputMode};

/// Most rows the input box grows to before it scrolls.
const MAX_INPUT_ROWS: usize = 5;

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();
    let input_rows = app.query_input.split('\n').count().clamp(1, MAX_INPUT_ROWS) as u16;

    // Main layout: header, status, chat, input, footer
    let [header_area, status_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(input_rows + 2),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_status(app, frame, status_area);
    render_chat(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);

    if app.show_model_picker {
        render_model_picker(app, frame, area);
    }
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let (gpu_text, gpu_style) = match app.session.capability() {
        None => ("Checking GPU...".to_string(), Style::default().fg(Color::Gray)),
        Some(report) if report.supported => {
            (report.summary(), Style::default().fg(Color::Green))
        }
        Some(report) => (
            format!("GPU not available: {}", report.reason),
            Style::default().fg(Color::Red).bold(),
        ),
    };

    let title = Line::from(vec![
        Span::styled(" Local Chat ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!("v{} ", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(gpu_text, gpu_style),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_status(app: &App, frame: &mut Frame, area: Rect) {
    if app.session.state() == SessionState::Loading {
        let (ratio, label) = match app.session.progress() {
            Some(progress) => (
                progress.fraction,
                format!("{} ({}%)", progress.label, progress.percent()),
            ),
            None => (0.0, format!("Loading {}...", app.session.selected_model())),
        };
        let gauge = Gauge::default()
            .gauge_style(Style::default().fg(Color::Cyan).bg(Color::Black))
            .ratio(ratio)
            .label(label);
        frame.render_widget(gauge, area);
        return;
    }

    let status = Line::from(vec![
        Span::styled(
            format!(" {} ", app.session.selected_model().display_name()),
            Style::default().fg(Color::Black).bg(Color::Cyan),
        ),
        Span::raw(" "),
        Span::styled(app.session.status_line(), Style::default().fg(Color::Gray)),
    ]);
    frame.render_widget(Paragraph::new(status), area);
}

fn role_header(role: EntryRole) -> Option<Line<'static>> {
    let (label, color) = match role {
        EntryRole::User => ("You:", Color::Cyan),
        EntryRole::Assistant => ("AI:", Color::Yellow),
        EntryRole::Error => ("Error:", Color::Red),
        EntryRole::Notice => return None,
    };
    Some(Line::from(Span::styled(
        label,
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    )))
}

/// Turn one formatted markup line into a styled terminal line.
fn styled_line(line: &markup::Line, base: Style) -> Line<'static> {
    if line.kind == LineKind::Code {
        return Line::from(vec![
            Span::styled("│ ", Style::default().fg(Color::DarkGray)),
            Span::styled(line.plain(), Style::default().fg(Color::Green)),
        ]);
    }

    let spans: Vec<Span<'static>> = line
        .spans
        .iter()
        .map(|span| match span {
            markup::Span::Text(text) => Span::styled(text.clone(), base),
            markup::Span::Strong(text) => {
                Span::styled(text.clone(), base.add_modifier(Modifier::BOLD))
            }
            markup::Span::Code(text) => {
                Span::styled(text.clone(), base.fg(Color::Green).bg(Color::Black))
            }
        })
        .collect();
    Line::from(spans)
}

fn entry_lines(entry: &TranscriptEntry, animation_frame: u8) -> Vec<Line<'static>> {
    let mut lines: Vec<Line> = Vec::new();
    lines.extend(role_header(entry.role));

    let base = match entry.role {
        EntryRole::Error => Style::default().fg(Color::Red),
        EntryRole::Notice => Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
        _ => Style::default(),
    };

    if entry.streaming && entry.content.is_empty() {
        // Animated ellipsis: cycles through ".", "..", "..."
        let dots = ".".repeat((animation_frame as usize) + 1);
        lines.push(Line::from(Span::styled(
            format!("Thinking{}", dots),
            Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
        )));
    } else {
        lines.extend(entry.lines.iter().map(|line| styled_line(line, base)));
        if entry.streaming {
            if let Some(last) = lines.last_mut() {
                last.push_span(Span::styled("▌", Style::default().fg(Color::Yellow)));
            }
        }
    }

    lines.push(Line::default());
    lines
}

/// Split text into alternating runs of whitespace and non-whitespace.
fn split_words(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut blank = None;
    for (i, c) in text.char_indices() {
        let is_blank = c.is_whitespace();
        if blank.is_some_and(|b| b != is_blank) {
            pieces.push(&text[start..i]);
            start = i;
        }
        blank = Some(is_blank);
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Word-wrap one styled line into rows no wider than `width`.
///
/// The chat paragraph is drawn without ratatui's own wrapping, so the number
/// of rows returned here is exactly what ends up on screen.
fn wrap_line(line: Line<'static>, width: usize) -> Vec<Line<'static>> {
    if width == 0 {
        return vec![line];
    }

    let mut rows = Vec::new();
    let mut row: Vec<Span<'static>> = Vec::new();
    let mut row_len = 0;

    for span in line.spans {
        let style = span.style;
        for piece in split_words(&span.content) {
            let len = piece.chars().count();
            if row_len + len <= width {
                row.push(Span::styled(piece.to_string(), style));
                row_len += len;
                continue;
            }

            // Whitespace at a break point is dropped
            if piece.starts_with(char::is_whitespace) {
                if row_len > 0 {
                    rows.push(Line::from(std::mem::take(&mut row)));
                    row_len = 0;
                }
                continue;
            }

            if row_len > 0 && (len <= width || row_len == width) {
                rows.push(Line::from(std::mem::take(&mut row)));
                row_len = 0;
            }

            // Words longer than a row are split across rows
            let mut rest = piece;
            while rest.chars().count() > width - row_len {
                let split = rest
                    .char_indices()
                    .nth(width - row_len)
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                row.push(Span::styled(rest[..split].to_string(), style));
                rows.push(Line::from(std::mem::take(&mut row)));
                row_len = 0;
                rest = &rest[split..];
            }
            if !rest.is_empty() {
                row.push(Span::styled(rest.to_string(), style));
                row_len += rest.chars().count();
            }
        }
    }

    rows.push(Line::from(row));
    rows
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    app.chat_area = Some(area);

    let border_color = if app.input_mode == InputMode::Normal {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    let title = match app.session.loaded_model() {
        Some(model) => format!(" Chat: {} ", model),
        None => " Chat ".to_string(),
    };
    let chat_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    let inner = chat_block.inner(area);
    let width = inner.width as usize;
    let lines: Vec<Line> = app
        .session
        .transcript()
        .entries()
        .iter()
        .flat_map(|entry| entry_lines(entry, app.animation_frame))
        .flat_map(|line| wrap_line(line, width))
        .collect();

    // Keep scroll state in step with what is actually on screen
    app.chat_height = inner.height;
    let rows = lines.len().min(u16::MAX as usize) as u16;
    app.chat_max_scroll = rows.saturating_sub(inner.height);
    if app.follow_output || app.chat_scroll > app.chat_max_scroll {
        app.chat_scroll = app.chat_max_scroll;
    }

    let chat = Paragraph::new(Text::from(lines))
        .block(chat_block)
        .scroll((app.chat_scroll, 0));

    frame.render_widget(chat, area);
}

/// Row and column of a char cursor inside multi-line text.
fn cursor_row_col(text: &str, cursor: usize) -> (usize, usize) {
    let mut row = 0;
    let mut col = 0;
    for c in text.chars().take(cursor) {
        if c == '\n' {
            row += 1;
            col = 0;
        } else {
            col += 1;
        }
    }
    (row, col)
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let editing = app.input_mode == InputMode::Editing;
    let can_send = app.session.state() == SessionState::Ready;
    let border_color = match (editing, can_send) {
        (true, true) => Color::Yellow,
        (true, false) => Color::Gray,
        _ => Color::DarkGray,
    };
    let title = match app.session.state() {
        SessionState::Ready => " Message (Enter to send, Shift+Enter for newline) ",
        SessionState::Generating => " Message (waiting for reply) ",
        _ => " Message (load a model first) ",
    };

    let input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    // Visible window of the input, scrolled to keep the cursor on screen
    let inner_width = area.width.saturating_sub(2) as usize;
    let inner_height = area.height.saturating_sub(2) as usize;
    let (cursor_row, cursor_col) = cursor_row_col(&app.query_input, app.query_cursor);

    let row_offset = (cursor_row + 1).saturating_sub(inner_height.max(1));
    let col_offset = if inner_width == 0 {
        0
    } else {
        (cursor_col + 1).saturating_sub(inner_width)
    };

    let visible: Vec<Line> = app
        .query_input
        .split('\n')
        .skip(row_offset)
        .take(inner_height)
        .map(|row| Line::from(row.chars().skip(col_offset).take(inner_width).collect::<String>()))
        .collect();

    // Use cyan text to match the "You:" style - visible in both light and dark terminals
    let input = Paragraph::new(Text::from(visible))
        .style(Style::default().fg(Color::Cyan))
        .block(input_block);

    frame.render_widget(input, area);

    // Show cursor when editing
    if editing && !app.show_model_picker {
        frame.set_cursor_position((
            area.x + 1 + (cursor_col - col_offset) as u16,
            area.y + 1 + (cursor_row - row_offset) as u16,
        ));
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let mode_style = match app.input_mode {
        InputMode::Normal => Style::default().bg(Color::Blue).fg(Color::White),
        InputMode::Editing => Style::default().bg(Color::Yellow).fg(Color::Black),
    };
    let mode_text = match app.input_mode {
        InputMode::Normal => " NORMAL ",
        InputMode::Editing => " INSERT ",
    };

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);
    let hint = |key: &'static str, label: &'static str| {
        [
            Span::styled(format!(" {key} "), key_style),
            Span::styled(format!(" {label} "), label_style),
        ]
    };

    let mut spans = vec![Span::styled(mode_text, mode_style), Span::raw(" ")];

    if let Some(flash) = &app.flash {
        spans.push(Span::styled(
            format!(" {flash} "),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
        frame.render_widget(Paragraph::new(Line::from(spans)), area);
        return;
    }

    if app.show_model_picker {
        spans.extend(hint("j/k", "move"));
        spans.extend(hint("Enter", "select"));
        spans.extend(hint("Esc", "cancel"));
    } else if app.input_mode == InputMode::Editing {
        spans.extend(hint("Enter", "send"));
        spans.extend(hint("Shift+Enter", "newline"));
        spans.extend(hint("Esc", "done"));
    } else {
        if app.session.can_load() {
            spans.extend(hint("L", "load"));
        }
        if app.session.can_select_model() {
            spans.extend(hint("M", "model"));
        }
        if app.session.can_unload() {
            spans.extend(hint("U", "unload"));
        }
        spans.extend(hint("i", "type"));
        spans.extend(hint("j/k", "scroll"));
        spans.extend(hint("q", "quit"));
    }

    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn render_model_picker(app: &mut App, frame: &mut Frame, area: Rect) {
    // Calculate popup size and position (centered)
    let popup_width = 44.min(area.width.saturating_sub(4));
    let popup_height = (app.available_models.len() as u16 + 2).min(area.height.saturating_sub(4));

    let popup_x = (area.width.saturating_sub(popup_width)) / 2;
    let popup_y = (area.height.saturating_sub(popup_height)) / 2;

    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    // Clear the area behind the popup
    frame.render_widget(Clear, popup_area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(" Select Model (Enter to select, Esc to cancel) ");

    let current = app.session.selected_model();
    let items: Vec<ListItem> = app
        .available_models
        .iter()
        .map(|model| {
            let style = if *model == current {
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!(" {:<14}", model.display_name()), style),
                Span::styled(model.as_str(), Style::default().fg(Color::Gray)),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::Blue)
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, popup_area, &mut app.model_picker_state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::{app, loaded_app};
    use ratatui::{backend::TestBackend, Terminal};

    #[test]
    fn test_cursor_row_col() {
        assert_eq!(cursor_row_col("abc", 2), (0, 2));
        assert_eq!(cursor_row_col("ab\ncd", 3), (1, 0));
        assert_eq!(cursor_row_col("ab\ncd", 5), (1, 2));
    }

    fn row_texts(rows: &[Line]) -> Vec<String> {
        rows.iter()
            .map(|row| row.spans.iter().map(|s| s.content.as_ref()).collect())
            .collect()
    }

    fn screen(terminal: &Terminal<TestBackend>) -> String {
        let buffer = terminal.backend().buffer();
        buffer.content.iter().map(|cell| cell.symbol()).collect()
    }

    #[test]
    fn test_wrap_line_breaks_on_words() {
        let rows = wrap_line(Line::from("the quick brown fox jumps"), 10);
        assert_eq!(row_texts(&rows), vec!["the quick ", "brown fox ", "jumps"]);

        assert_eq!(wrap_line(Line::default(), 10).len(), 1);
    }

    #[test]
    fn test_wrap_line_splits_long_words_and_keeps_styles() {
        let bold = Style::default().add_modifier(Modifier::BOLD);
        let line = Line::from(vec![
            Span::raw("ab "),
            Span::styled("x".repeat(25), bold),
        ]);
        let rows = wrap_line(line, 10);

        assert_eq!(
            row_texts(&rows),
            vec!["ab xxxxxxx", "xxxxxxxxxx", "xxxxxxxx"]
        );
        assert!(rows.iter().all(|row| row.width() <= 10));
        assert_eq!(rows[1].spans[0].style, bold);
    }

    #[test]
    fn test_long_streamed_prose_stays_in_view() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut app, _rx) = loaded_app(&dir);
        let request = app.session.submit("Tell me a story").unwrap();
        let reply = format!("{}ZZEND", "abcdefghi ".repeat(200));
        assert!(app.session.apply_delta(request.id, &reply));

        let mut terminal = Terminal::new(TestBackend::new(80, 20)).unwrap();
        terminal.draw(|frame| render(&mut app, frame)).unwrap();

        assert!(app.follow_output);
        assert_eq!(app.chat_scroll, app.chat_max_scroll);
        assert!(screen(&terminal).contains("ZZEND"));
    }

    #[test]
    fn test_styled_line_marks_bold_and_code() {
        let formatted = markup::format("a **b** `c`");
        let line = styled_line(&formatted[0], Style::default());
        let bold = line.spans.iter().find(|s| s.content == "b").unwrap();
        assert!(bold.style.add_modifier.contains(Modifier::BOLD));
        let code = line.spans.iter().find(|s| s.content == "c").unwrap();
        assert_eq!(code.style.fg, Some(Color::Green));
    }

    #[test]
    fn test_render_shows_welcome_and_hints() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut app, _rx) = app(&dir);
        let mut terminal = Terminal::new(TestBackend::new(80, 20)).unwrap();
        terminal.draw(|frame| render(&mut app, frame)).unwrap();

        let screen = screen(&terminal);
        assert!(screen.contains("GPU ready"));
        assert!(screen.contains("Select a model and load it"));
        assert!(screen.contains("load"));
        assert!(screen.contains("No model loaded"));
    }
}
