//! Udev Rule Interpreter: loads a directory of declarative rule files and
//! compiles them into a flat rule table with resolved jumps, then
//! evaluates that table per port.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

const RULE_FILE_PREFIXES: &[&str] = &["77-mm-", "78-mm-", "79-mm-", "80-mm-"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdevError {
    NoRuleFiles,
    ParseError { file: String, line: usize, message: String },
    UnresolvedLabel { label: String },
    AmbiguousLabel { label: String },
}

impl fmt::Display for UdevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdevError::NoRuleFiles => f.write_str("no udev rule files found"),
            UdevError::ParseError { file, line, message } => {
                write!(f, "{file}:{line}: {message}")
            }
            UdevError::UnresolvedLabel { label } => write!(f, "unresolved label {label:?}"),
            UdevError::AmbiguousLabel { label } => write!(f, "ambiguous label {label:?}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for UdevError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCondition {
    pub parameter: String,
    pub op: MatchOp,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleResult {
    SetProperty { name: String, value: String },
    Label(String),
    /// Unresolved immediately after line-parsing; replaced with `Goto`
    /// once the enclosing file's labels are resolved.
    GotoLabel(String),
    Goto(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdevRule {
    pub conditions: Vec<MatchCondition>,
    pub result: RuleResult,
}

/// Ordered, jump-resolved rule table.
pub struct UdevRuleSet {
    rules: Vec<UdevRule>,
}

/// Queries kernel-device property values; implemented by a real udev
/// binding or an in-memory test double. Neither udev itself nor device
/// discovery policy are in scope here.
pub trait KernelDevice {
    fn property(&self, name: &str) -> Option<String>;
}

impl UdevRuleSet {
    /// Loads rule files from `dir`, filtered to the known filename-prefix
    /// set, in lexicographic order. An empty resulting file list is a
    /// fatal error.
    pub fn load_dir(dir: &Path) -> Result<Self, UdevError> {
        let mut paths: Vec<_> = fs::read_dir(dir)
            .map_err(|_| UdevError::NoRuleFiles)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| RULE_FILE_PREFIXES.iter().any(|prefix| n.starts_with(prefix)))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(UdevError::NoRuleFiles);
        }

        let mut rules = Vec::new();
        for path in paths {
            let text = fs::read_to_string(&path).map_err(|_| UdevError::NoRuleFiles)?;
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
            let file_start = rules.len();
            parse_file(&file_name, &text, &mut rules)?;
            resolve_labels_in_range(&mut rules, file_start, rules.len())?;
        }

        Ok(UdevRuleSet { rules })
    }

    /// Builds a rule set directly from already-parsed rules, resolving
    /// labels across the whole set. Mainly useful for tests.
    pub fn from_rules(mut rules: Vec<UdevRule>) -> Result<Self, UdevError> {
        let len = rules.len();
        resolve_labels_in_range(&mut rules, 0, len)?;
        Ok(UdevRuleSet { rules })
    }

    pub fn rules(&self) -> &[UdevRule] {
        &self.rules
    }

    /// Evaluates the rule table against `device`'s properties, returning
    /// the final (property name -> value) mapping. Later `SetProperty`
    /// assignments for the same name override earlier ones.
    pub fn evaluate(&self, device: &dyn KernelDevice) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        let mut index = 0usize;
        while index < self.rules.len() {
            let rule = &self.rules[index];
            let all_match = rule.conditions.iter().all(|cond| {
                let actual = device.property(&cond.parameter).unwrap_or_default();
                match cond.op {
                    MatchOp::Equal => actual == cond.value,
                    MatchOp::NotEqual => actual != cond.value,
                }
            });
            if !all_match {
                index += 1;
                continue;
            }
            match &rule.result {
                RuleResult::SetProperty { name, value } => {
                    properties.insert(name.clone(), value.clone());
                    index += 1;
                }
                RuleResult::Label(_) => {
                    index += 1;
                }
                RuleResult::Goto(target) => {
                    index = *target;
                }
                RuleResult::GotoLabel(_) => {
                    // Unreachable after a successful load/from_rules, which
                    // always resolves labels before returning.
                    index += 1;
                }
            }
        }
        properties
    }
}

fn resolve_labels_in_range(
    rules: &mut [UdevRule],
    start: usize,
    end: usize,
) -> Result<(), UdevError> {
    for i in start..end {
        let label = match &rules[i].result {
            RuleResult::GotoLabel(label) => label.clone(),
            _ => continue,
        };
        let matches: Vec<usize> = ((i + 1)..end)
            .filter(|&j| matches!(&rules[j].result, RuleResult::Label(l) if *l == label))
            .collect();
        match matches.len() {
            0 => return Err(UdevError::UnresolvedLabel { label }),
            1 => rules[i].result = RuleResult::Goto(matches[0]),
            _ => return Err(UdevError::AmbiguousLabel { label }),
        }
    }
    Ok(())
}

fn parse_file(file_name: &str, text: &str, out: &mut Vec<UdevRule>) -> Result<(), UdevError> {
    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let rule = parse_line(file_name, line_no + 1, line)?;
        out.push(rule);
    }
    Ok(())
}

fn parse_line(file_name: &str, line_no: usize, line: &str) -> Result<UdevRule, UdevError> {
    let items: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if items.is_empty() {
        return Err(err(file_name, line_no, "empty rule line"));
    }

    let (match_items, result_item) = items.split_at(items.len() - 1);
    let result_item = result_item[0];

    let mut conditions = Vec::with_capacity(match_items.len());
    for item in match_items {
        conditions.push(parse_condition(file_name, line_no, item)?);
    }

    let result = parse_result(file_name, line_no, result_item)?;

    Ok(UdevRule { conditions, result })
}

fn parse_condition(file_name: &str, line_no: usize, item: &str) -> Result<MatchCondition, UdevError> {
    let (lhs, op, rhs) = split_item(file_name, line_no, item)?;
    let op = match op {
        "==" => MatchOp::Equal,
        "!=" => MatchOp::NotEqual,
        _ => {
            return Err(err(
                file_name,
                line_no,
                "match conditions must use == or !=",
            ))
        }
    };
    Ok(MatchCondition {
        parameter: lhs,
        op,
        value: rhs,
    })
}

fn parse_result(file_name: &str, line_no: usize, item: &str) -> Result<RuleResult, UdevError> {
    let (lhs, op, rhs) = split_item(file_name, line_no, item)?;
    if op != "=" {
        return Err(err(file_name, line_no, "results must use ="));
    }
    if lhs == "LABEL" {
        return Ok(RuleResult::Label(rhs));
    }
    if lhs == "GOTO" {
        return Ok(RuleResult::GotoLabel(rhs));
    }
    if let Some(name) = lhs.strip_prefix("ENV{").and_then(|s| s.strip_suffix('}')) {
        return Ok(RuleResult::SetProperty {
            name: name.to_string(),
            value: rhs,
        });
    }
    Err(err(
        file_name,
        line_no,
        "result LHS must be LABEL, GOTO, or ENV{NAME}",
    ))
}

/// Splits `LHS op RHS` on the first of `==`, `!=`, `=` (checked in that
/// order so `==`/`!=` are not mis-split as a bare `=`), stripping quotes
/// and whitespace from both sides.
fn split_item(file_name: &str, line_no: usize, item: &str) -> Result<(String, &'static str, String), UdevError> {
    let (lhs, op, rhs) = if let Some(pos) = item.find("==") {
        (&item[..pos], "==", &item[pos + 2..])
    } else if let Some(pos) = item.find("!=") {
        (&item[..pos], "!=", &item[pos + 2..])
    } else if let Some(pos) = item.find('=') {
        (&item[..pos], "=", &item[pos + 1..])
    } else {
        return Err(err(file_name, line_no, "item is missing an operator"));
    };
    let lhs = lhs.trim().to_string();
    let rhs = strip_quotes(rhs.trim()).to_string();
    if lhs.is_empty() || rhs.is_empty() {
        return Err(err(file_name, line_no, "empty LHS or RHS"));
    }
    Ok((lhs, op, rhs))
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn err(file_name: &str, line_no: usize, message: &str) -> UdevError {
    UdevError::ParseError {
        file: file_name.to_string(),
        line: line_no,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDevice {
        props: HashMap<String, String>,
    }

    impl KernelDevice for FakeDevice {
        fn property(&self, name: &str) -> Option<String> {
            self.props.get(name).cloned()
        }
    }

    fn device(pairs: &[(&str, &str)]) -> FakeDevice {
        FakeDevice {
            props: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn jump_over_skips_property() {
        let text = "SUBSYSTEM==\"tty\", GOTO=\"skip\"\nENV{X}=\"1\"\nLABEL=\"skip\"\nENV{Y}=\"1\"\n";
        let mut rules = Vec::new();
        parse_file("80-mm-test.rules", text, &mut rules).unwrap();
        let rule_set = UdevRuleSet::from_rules(rules).unwrap();

        let tty = device(&[("SUBSYSTEM", "tty")]);
        let result = rule_set.evaluate(&tty);
        assert_eq!(result.get("Y"), Some(&"1".to_string()));
        assert_eq!(result.get("X"), None);

        let other = device(&[("SUBSYSTEM", "net")]);
        let result = rule_set.evaluate(&other);
        assert_eq!(result.get("X"), Some(&"1".to_string()));
        assert_eq!(result.get("Y"), Some(&"1".to_string()));
    }

    #[test]
    fn unresolved_label_is_fatal() {
        let text = "GOTO=\"nowhere\"\n";
        let mut rules = Vec::new();
        parse_file("80-mm-test.rules", text, &mut rules).unwrap();
        assert!(matches!(
            UdevRuleSet::from_rules(rules).unwrap_err(),
            UdevError::UnresolvedLabel { .. }
        ));
    }

    #[test]
    fn ambiguous_label_is_fatal() {
        let text = "GOTO=\"dup\"\nLABEL=\"dup\"\nLABEL=\"dup\"\n";
        let mut rules = Vec::new();
        parse_file("80-mm-test.rules", text, &mut rules).unwrap();
        assert!(matches!(
            UdevRuleSet::from_rules(rules).unwrap_err(),
            UdevError::AmbiguousLabel { .. }
        ));
    }

    #[test]
    fn later_set_property_overrides_earlier() {
        let text = "ENV{X}=\"1\"\nENV{X}=\"2\"\n";
        let mut rules = Vec::new();
        parse_file("80-mm-test.rules", text, &mut rules).unwrap();
        let rule_set = UdevRuleSet::from_rules(rules).unwrap();
        let result = rule_set.evaluate(&device(&[]));
        assert_eq!(result.get("X"), Some(&"2".to_string()));
    }

    #[test]
    fn empty_lhs_or_rhs_is_parse_error() {
        let mut rules = Vec::new();
        let err = parse_file("80-mm-test.rules", "==\"tty\"\n", &mut rules).unwrap_err();
        assert!(matches!(err, UdevError::ParseError { .. }));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# a comment\n\nENV{X}=\"1\"\n";
        let mut rules = Vec::new();
        parse_file("80-mm-test.rules", text, &mut rules).unwrap();
        assert_eq!(rules.len(), 1);
    }
}
