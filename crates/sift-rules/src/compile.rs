use crate::RuleError;
use regex::{Regex, RegexBuilder};
use sift_core::{Condition, MailRule, MatchMode, RuleAction};
use uuid::Uuid;

/// Compiled size cap for subject patterns.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Decrypted fields a rule is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct MessageView {
    pub sender: String,
    pub subject: String,
    /// `None` until a rule that needs it asks for it.
    pub body: Option<String>,
    pub folder: String,
    pub has_attachments: bool,
}

#[derive(Debug, Clone)]
enum Predicate {
    SenderEquals(String),
    SenderContains(String),
    SenderDomain(String),
    SubjectContains(String),
    SubjectRegex(Regex),
    BodyContains(String),
    HasAttachment(bool),
    FolderEquals(String),
    /// A pattern that failed to compile; never matches.
    Broken,
}

impl Predicate {
    fn compile(rule_id: Uuid, condition: &Condition) -> Self {
        match condition {
            Condition::SenderEquals(value) => Predicate::SenderEquals(value.trim().to_lowercase()),
            Condition::SenderContains(value) => Predicate::SenderContains(value.to_lowercase()),
            Condition::SenderDomain(value) => {
                Predicate::SenderDomain(value.trim().trim_start_matches('@').to_lowercase())
            }
            Condition::SubjectContains(value) => Predicate::SubjectContains(value.to_lowercase()),
            Condition::SubjectRegex(pattern) => match subject_regex(pattern) {
                Ok(regex) => Predicate::SubjectRegex(regex),
                Err(err) => {
                    tracing::warn!(rule = %rule_id, error = %err, "subject pattern disabled");
                    Predicate::Broken
                }
            },
            Condition::BodyContains(value) => Predicate::BodyContains(value.to_lowercase()),
            Condition::HasAttachment(value) => Predicate::HasAttachment(*value),
            Condition::FolderEquals(value) => {
                Predicate::FolderEquals(mailbox_name(value.trim()).to_string())
            }
        }
    }

    fn matches(&self, view: &MessageView) -> bool {
        match self {
            Predicate::SenderEquals(value) => view.sender.to_lowercase() == *value,
            Predicate::SenderContains(value) => view.sender.to_lowercase().contains(value),
            Predicate::SenderDomain(domain) => {
                let sender = view.sender.to_lowercase();
                let Some((_, host)) = sender.rsplit_once('@') else {
                    return false;
                };
                host == domain || host.ends_with(&format!(".{domain}"))
            }
            Predicate::SubjectContains(value) => view.subject.to_lowercase().contains(value),
            Predicate::SubjectRegex(regex) => regex.is_match(&view.subject),
            Predicate::BodyContains(value) => view
                .body
                .as_deref()
                .is_some_and(|body| body.to_lowercase().contains(value)),
            Predicate::HasAttachment(value) => view.has_attachments == *value,
            Predicate::FolderEquals(value) => mailbox_name(&view.folder) == value.as_str(),
            Predicate::Broken => false,
        }
    }
}

/// Mailbox names are case-sensitive, except INBOX.
fn mailbox_name(name: &str) -> &str {
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX"
    } else {
        name
    }
}

fn subject_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
}

/// A rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: MailRule,
    predicates: Vec<Predicate>,
    needs_body: bool,
}

impl CompiledRule {
    pub fn compile(rule: MailRule) -> Self {
        let predicates = rule
            .conditions
            .predicates
            .iter()
            .map(|condition| Predicate::compile(rule.id, condition))
            .collect();
        let needs_body = rule.conditions.needs_body();
        Self {
            rule,
            predicates,
            needs_body,
        }
    }

    pub fn needs_body(&self) -> bool {
        self.needs_body
    }

    /// A rule without predicates matches nothing.
    pub fn matches(&self, view: &MessageView) -> bool {
        if self.predicates.is_empty() {
            return false;
        }
        match self.rule.conditions.match_mode {
            MatchMode::All => self.predicates.iter().all(|p| p.matches(view)),
            MatchMode::Any => self.predicates.iter().any(|p| p.matches(view)),
        }
    }

    pub fn stops_processing(&self) -> bool {
        self.rule
            .actions
            .iter()
            .any(|action| matches!(action, RuleAction::StopProcessing))
    }
}

/// Compile and order rules for one pass: priority ascending, ties by id.
pub fn compile_rules(mut rules: Vec<MailRule>) -> Vec<CompiledRule> {
    rules.sort_by_key(MailRule::precedence);
    rules.into_iter().map(CompiledRule::compile).collect()
}

/// Save-time checks. Rejects blank names and values, patterns that do not
/// compile, and rules that could never match or do nothing.
pub fn validate_rule(rule: &MailRule) -> Result<(), RuleError> {
    if rule.name.trim().is_empty() {
        return Err(RuleError::Invalid("rule name is empty".to_string()));
    }
    if rule.conditions.predicates.is_empty() {
        return Err(RuleError::Invalid(format!(
            "rule '{}' has no conditions",
            rule.name
        )));
    }
    if rule.actions.is_empty() {
        return Err(RuleError::Invalid(format!("rule '{}' has no actions", rule.name)));
    }

    for condition in &rule.conditions.predicates {
        let value = match condition {
            Condition::SenderEquals(value)
            | Condition::SenderContains(value)
            | Condition::SenderDomain(value)
            | Condition::SubjectContains(value)
            | Condition::BodyContains(value)
            | Condition::FolderEquals(value) => value,
            Condition::SubjectRegex(pattern) => {
                if pattern.trim().is_empty() {
                    return Err(RuleError::Invalid("subject pattern is empty".to_string()));
                }
                subject_regex(pattern)
                    .map_err(|err| RuleError::Invalid(format!("subject pattern: {err}")))?;
                continue;
            }
            Condition::HasAttachment(_) => continue,
        };
        if value.trim().is_empty() {
            return Err(RuleError::Invalid(format!(
                "rule '{}' has an empty condition value",
                rule.name
            )));
        }
    }

    for action in &rule.actions {
        let blank = match action {
            RuleAction::MoveToFolder { folder } => folder.trim().is_empty(),
            RuleAction::ApplyTag { tag } => tag.trim().is_empty(),
            _ => false,
        };
        if blank {
            return Err(RuleError::Invalid(format!(
                "{} action needs a value",
                action.kind()
            )));
        }
    }

    Ok(())
}
