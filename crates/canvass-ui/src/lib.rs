use canvass_core::{Precinct, PrecinctChanges, PrecinctId, SharedPrecinctStore};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use serde_json::Value;
use std::io::{self, Stdout};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UiMode {
    #[default]
    Normal,
    Insert,
}

impl UiMode {
    fn label(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Insert => "Insert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditableField {
    PriorityScore,
    TargetHouseholds,
    DemographicProfile,
    KeyIssues,
    RecommendedScript,
}

impl EditableField {
    pub const ALL: [EditableField; 5] = [
        Self::PriorityScore,
        Self::TargetHouseholds,
        Self::DemographicProfile,
        Self::KeyIssues,
        Self::RecommendedScript,
    ];

    fn label(self) -> &'static str {
        match self {
            Self::PriorityScore => "priority score",
            Self::TargetHouseholds => "target households",
            Self::DemographicProfile => "demographic profile",
            Self::KeyIssues => "key issues",
            Self::RecommendedScript => "recommended script",
        }
    }

    fn field_name(self) -> &'static str {
        match self {
            Self::PriorityScore => "priority_score",
            Self::TargetHouseholds => "target_households",
            Self::DemographicProfile => "demographic_profile",
            Self::KeyIssues => "key_issues",
            Self::RecommendedScript => "recommended_script",
        }
    }

    fn next(self) -> Self {
        let index = Self::ALL
            .iter()
            .position(|field| *field == self)
            .unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }

    fn previous(self) -> Self {
        let index = Self::ALL
            .iter()
            .position(|field| *field == self)
            .unwrap_or(0);
        Self::ALL[(index + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

/// Display-form values for the editable fields. `key_issues` is held as a
/// comma-separated string and split/trimmed back into a list on save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditForm {
    pub priority_score: String,
    pub target_households: String,
    pub demographic_profile: String,
    pub key_issues: String,
    pub recommended_script: String,
}

impl EditForm {
    fn from_precinct(precinct: &Precinct) -> Self {
        Self {
            priority_score: precinct.priority_score.to_string(),
            target_households: precinct.target_households.to_string(),
            demographic_profile: precinct.demographic_profile.clone(),
            key_issues: precinct.key_issues.join(", "),
            recommended_script: precinct.recommended_script.clone(),
        }
    }

    fn value(&self, field: EditableField) -> &str {
        match field {
            EditableField::PriorityScore => &self.priority_score,
            EditableField::TargetHouseholds => &self.target_households,
            EditableField::DemographicProfile => &self.demographic_profile,
            EditableField::KeyIssues => &self.key_issues,
            EditableField::RecommendedScript => &self.recommended_script,
        }
    }

    fn set_value(&mut self, field: EditableField, value: String) {
        match field {
            EditableField::PriorityScore => self.priority_score = value,
            EditableField::TargetHouseholds => self.target_households = value,
            EditableField::DemographicProfile => self.demographic_profile = value,
            EditableField::KeyIssues => self.key_issues = value,
            EditableField::RecommendedScript => self.recommended_script = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecinctSummary {
    pub id: PrecinctId,
    pub priority_score: u8,
    pub target_households: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardedAction {
    Select(usize),
    Reload,
    Quit,
}

pub struct DashboardState {
    store: SharedPrecinctStore,
    show_metrics: bool,
    pub mode: UiMode,
    pub precincts: Vec<PrecinctSummary>,
    pub selected_index: usize,
    pub detail: Option<Precinct>,
    pub baseline: EditForm,
    pub form: EditForm,
    pub focused_field: EditableField,
    pub edit_buffer: String,
    pub notice: Option<Notice>,
    pending_discard: Option<GuardedAction>,
}

impl DashboardState {
    pub fn new(store: SharedPrecinctStore, show_metrics: bool) -> Self {
        let mut state = Self {
            store,
            show_metrics,
            mode: UiMode::Normal,
            precincts: Vec::new(),
            selected_index: 0,
            detail: None,
            baseline: EditForm::default(),
            form: EditForm::default(),
            focused_field: EditableField::PriorityScore,
            edit_buffer: String::new(),
            notice: None,
            pending_discard: None,
        };
        state.refresh_selector();
        state.load_detail(0);
        state
    }

    pub fn is_dirty(&self) -> bool {
        self.form != self.baseline
    }

    fn refresh_selector(&mut self) {
        self.precincts = self
            .store
            .get_all_precincts()
            .into_iter()
            .map(|precinct| PrecinctSummary {
                id: precinct.precinct_id,
                priority_score: precinct.priority_score,
                target_households: precinct.target_households,
            })
            .collect();
        if self.selected_index >= self.precincts.len() {
            self.selected_index = self.precincts.len().saturating_sub(1);
        }
    }

    fn load_detail(&mut self, index: usize) {
        let Some(summary) = self.precincts.get(index) else {
            self.detail = None;
            self.baseline = EditForm::default();
            self.form = EditForm::default();
            return;
        };

        match self.store.get_precinct(&summary.id) {
            Ok(precinct) => {
                self.baseline = EditForm::from_precinct(&precinct);
                self.form = self.baseline.clone();
                self.detail = Some(precinct);
                self.selected_index = index;
            }
            Err(err) => {
                self.notice = Some(Notice::error(err.to_string()));
            }
        }
    }

    fn guard_unsaved(&mut self, action: GuardedAction) -> bool {
        if !self.is_dirty() {
            self.pending_discard = None;
            return true;
        }
        if self.pending_discard == Some(action) {
            self.pending_discard = None;
            return true;
        }
        self.pending_discard = Some(action);
        self.notice = Some(Notice::info(
            "unsaved edits; press again to discard, or s to save",
        ));
        false
    }

    fn move_selection(&mut self, delta: isize) {
        if self.precincts.is_empty() {
            return;
        }
        let last = self.precincts.len() - 1;
        let target = self
            .selected_index
            .saturating_add_signed(delta)
            .min(last);
        if target == self.selected_index {
            return;
        }
        if self.guard_unsaved(GuardedAction::Select(target)) {
            self.load_detail(target);
            self.notice = None;
        }
    }

    fn jump_selection(&mut self, index: usize) {
        if self.precincts.is_empty() || index == self.selected_index {
            return;
        }
        if self.guard_unsaved(GuardedAction::Select(index)) {
            self.load_detail(index);
            self.notice = None;
        }
    }

    fn cycle_field(&mut self, forward: bool) {
        self.focused_field = if forward {
            self.focused_field.next()
        } else {
            self.focused_field.previous()
        };
    }

    fn begin_edit(&mut self) {
        if self.detail.is_none() {
            self.notice = Some(Notice::error("no precinct selected"));
            return;
        }
        self.pending_discard = None;
        self.edit_buffer = self.form.value(self.focused_field).to_owned();
        self.mode = UiMode::Insert;
    }

    fn insert_char(&mut self, ch: char) {
        self.edit_buffer.push(ch);
    }

    fn backspace(&mut self) {
        self.edit_buffer.pop();
    }

    fn commit_edit(&mut self) {
        let buffer = std::mem::take(&mut self.edit_buffer);
        self.form.set_value(self.focused_field, buffer);
        self.mode = UiMode::Normal;
    }

    fn cancel_edit(&mut self) {
        self.edit_buffer.clear();
        self.mode = UiMode::Normal;
    }

    fn save(&mut self) {
        self.pending_discard = None;
        let Some(precinct) = self.detail.as_ref() else {
            self.notice = Some(Notice::error("no precinct selected"));
            return;
        };
        if !self.is_dirty() {
            self.notice = Some(Notice::info("no changes to save"));
            return;
        }

        let changes = match form_changes(&self.form, &self.baseline) {
            Ok(changes) => changes,
            Err(message) => {
                self.notice = Some(Notice::error(message));
                return;
            }
        };
        let id = precinct.precinct_id.clone();
        let field_count = changes.len();

        if let Err(err) = self.store.update_precinct(&id, &changes) {
            self.notice = Some(Notice::error(err.to_string()));
            return;
        }

        // Re-render committed state from a fresh read rather than trusting
        // the local form.
        match self.store.get_precinct(&id) {
            Ok(fresh) => {
                self.baseline = EditForm::from_precinct(&fresh);
                self.form = self.baseline.clone();
                self.detail = Some(fresh);
            }
            Err(err) => {
                self.notice = Some(Notice::error(err.to_string()));
                return;
            }
        }
        self.refresh_selector();
        self.notice = Some(Notice::info(format!(
            "saved {field_count} field(s) to {id}"
        )));
    }

    fn reload(&mut self) {
        if !self.guard_unsaved(GuardedAction::Reload) {
            return;
        }
        self.refresh_selector();
        self.load_detail(self.selected_index);
        self.notice = Some(Notice::info("reloaded from store"));
    }

    fn request_quit(&mut self) -> bool {
        self.guard_unsaved(GuardedAction::Quit)
    }

    fn clear_transient(&mut self) {
        self.pending_discard = None;
        self.notice = None;
    }
}

/// Builds the update payload from the edited form: only fields that differ
/// from the baseline are included, parsed from their display form.
fn form_changes(form: &EditForm, baseline: &EditForm) -> Result<PrecinctChanges, String> {
    let mut changes = PrecinctChanges::new();

    if form.priority_score != baseline.priority_score {
        let score: u8 = form
            .priority_score
            .trim()
            .parse()
            .map_err(|_| "priority score must be an integer between 0 and 100".to_owned())?;
        changes.insert("priority_score".to_owned(), Value::from(score));
    }
    if form.target_households != baseline.target_households {
        let households: u64 = form
            .target_households
            .trim()
            .parse()
            .map_err(|_| "target households must be a non-negative integer".to_owned())?;
        changes.insert("target_households".to_owned(), Value::from(households));
    }
    if form.demographic_profile != baseline.demographic_profile {
        changes.insert(
            "demographic_profile".to_owned(),
            Value::from(form.demographic_profile.clone()),
        );
    }
    if form.key_issues != baseline.key_issues {
        changes.insert(
            "key_issues".to_owned(),
            Value::from(split_key_issues(&form.key_issues)),
        );
    }
    if form.recommended_script != baseline.recommended_script {
        changes.insert(
            "recommended_script".to_owned(),
            Value::from(form.recommended_script.clone()),
        );
    }

    Ok(changes)
}

fn split_key_issues(display: &str) -> Vec<String> {
    display
        .split(',')
        .map(str::trim)
        .filter(|issue| !issue.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

pub fn handle_key_press(state: &mut DashboardState, key: KeyEvent) -> bool {
    if is_escape_to_normal(key) {
        if state.mode == UiMode::Insert {
            state.cancel_edit();
        } else {
            state.clear_transient();
        }
        return false;
    }

    match state.mode {
        UiMode::Insert => {
            handle_insert_key(state, key);
            false
        }
        UiMode::Normal => handle_normal_key(state, key),
    }
}

fn handle_insert_key(state: &mut DashboardState, key: KeyEvent) {
    match key.code {
        KeyCode::Enter => state.commit_edit(),
        KeyCode::Backspace => state.backspace(),
        KeyCode::Char(ch) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
            state.insert_char(ch);
        }
        _ => {}
    }
}

fn handle_normal_key(state: &mut DashboardState, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('j') | KeyCode::Down => state.move_selection(1),
        KeyCode::Char('k') | KeyCode::Up => state.move_selection(-1),
        KeyCode::Char('g') => state.jump_selection(0),
        KeyCode::Char('G') => {
            state.jump_selection(state.precincts.len().saturating_sub(1));
        }
        KeyCode::Tab => state.cycle_field(true),
        KeyCode::BackTab => state.cycle_field(false),
        KeyCode::Enter | KeyCode::Char('i') => state.begin_edit(),
        KeyCode::Char('s') => state.save(),
        KeyCode::Char('r') => state.reload(),
        KeyCode::Char('q') => return state.request_quit(),
        _ => {}
    }
    false
}

fn is_escape_to_normal(key: KeyEvent) -> bool {
    matches!(key.code, KeyCode::Esc) && key.modifiers.is_empty() || is_ctrl_char(key, '[')
}

fn is_ctrl_char(key: KeyEvent, ch: char) -> bool {
    matches!(key.code, KeyCode::Char(code_ch) if code_ch == ch)
        && key.modifiers == KeyModifiers::CONTROL
}

fn mode_help(mode: UiMode) -> &'static str {
    match mode {
        UiMode::Normal => {
            "j/k: select | g/G: first/last | Tab/S-Tab: field | Enter/i: edit | s: save | r: reload | q: quit"
        }
        UiMode::Insert => "editing field | Enter: apply | Esc/Ctrl-[: cancel",
    }
}

pub fn render_selector_panel(state: &DashboardState) -> String {
    if state.precincts.is_empty() {
        return "No precincts loaded.".to_owned();
    }

    let mut lines = Vec::new();
    for (index, summary) in state.precincts.iter().enumerate() {
        let selected = if index == state.selected_index {
            ">"
        } else {
            " "
        };
        lines.push(format!(
            "{selected} {:<12} pri {:>3}  hh {:>6}",
            summary.id.as_str(),
            summary.priority_score,
            summary.target_households
        ));
    }
    lines.join("\n")
}

pub fn render_detail_panel(state: &DashboardState) -> String {
    let Some(precinct) = state.detail.as_ref() else {
        return "No precinct selected.".to_owned();
    };

    let mut lines = vec![format!("precinct: {}", precinct.precinct_id), String::new()];
    for field in EditableField::ALL {
        let focused = if field == state.focused_field { ">" } else { " " };
        let edited = if state.form.value(field) != state.baseline.value(field) {
            "*"
        } else {
            " "
        };
        let value = if state.mode == UiMode::Insert && field == state.focused_field {
            state.edit_buffer.as_str()
        } else {
            state.form.value(field)
        };
        lines.push(format!("{focused}{edited} {:<20} {value}", field.label()));
    }
    lines.join("\n")
}

pub fn render_metrics_panel(state: &DashboardState) -> String {
    let Some(precinct) = state.detail.as_ref() else {
        return String::new();
    };
    if precinct.performance_metrics.is_empty() {
        return "No metrics recorded.".to_owned();
    }
    serde_json::to_string_pretty(&precinct.performance_metrics)
        .unwrap_or_else(|err| format!("failed to render metrics: {err}"))
}

pub fn render_footer(state: &DashboardState) -> String {
    let status = match state.notice.as_ref() {
        Some(notice) => match notice.level {
            NoticeLevel::Info => notice.message.clone(),
            NoticeLevel::Error => format!("error: {}", notice.message),
        },
        None => "ready".to_owned(),
    };
    format!(
        "{status} | mode: {} | {}",
        state.mode.label(),
        mode_help(state.mode)
    )
}

fn draw_dashboard(frame: &mut Frame<'_>, state: &DashboardState) {
    let area = frame.area();
    let layout = Layout::vertical([Constraint::Min(1), Constraint::Length(3)]);
    let [main, footer] = layout.areas(area);
    let main_layout = Layout::horizontal([Constraint::Percentage(35), Constraint::Percentage(65)]);
    let [selector_area, detail_area] = main_layout.areas(main);

    frame.render_widget(
        Paragraph::new(render_selector_panel(state))
            .block(Block::default().title("precincts").borders(Borders::ALL)),
        selector_area,
    );

    if state.show_metrics {
        let detail_layout = Layout::vertical([Constraint::Min(1), Constraint::Percentage(40)]);
        let [fields_area, metrics_area] = detail_layout.areas(detail_area);
        frame.render_widget(
            Paragraph::new(render_detail_panel(state))
                .wrap(Wrap { trim: false })
                .block(Block::default().title("precinct").borders(Borders::ALL)),
            fields_area,
        );
        frame.render_widget(
            Paragraph::new(render_metrics_panel(state))
                .wrap(Wrap { trim: false })
                .block(Block::default().title("metrics").borders(Borders::ALL)),
            metrics_area,
        );
    } else {
        frame.render_widget(
            Paragraph::new(render_detail_panel(state))
                .wrap(Wrap { trim: false })
                .block(Block::default().title("precinct").borders(Borders::ALL)),
            detail_area,
        );
    }

    frame.render_widget(
        Paragraph::new(render_footer(state))
            .block(Block::default().title("canvass").borders(Borders::ALL)),
        footer,
    );
}

pub struct Ui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Ui {
    pub fn init() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;
        Ok(Self { terminal })
    }

    pub fn run(&mut self, state: &mut DashboardState) -> io::Result<()> {
        loop {
            self.terminal.draw(|frame| draw_dashboard(frame, state))?;

            if event::poll(Duration::from_millis(250))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press && handle_key_press(state, key) {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

impl Drop for Ui {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().execute(LeaveAlternateScreen);
    }
}
