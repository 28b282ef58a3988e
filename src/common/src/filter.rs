// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Table filter: decides which tables a changefeed replicates and which DDL
//! events it discards.
//!
//! Rules are `schema.table` patterns with `*`/`?` wildcards. A leading `!`
//! excludes. The last matching rule decides; a table matching no rule is
//! filtered out. An empty rule list means `*.*`.

use regex::Regex;
use thiserror::Error;

use crate::config::FilterConfig;
use crate::ddl::ActionType;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },
}

struct Rule {
    exclude: bool,
    schema: Regex,
    table: Regex,
}

pub struct Filter {
    rules: Vec<Rule>,
    force_replicate: bool,
}

fn pattern_to_regex(pattern: &str) -> Result<Regex, FilterError> {
    let mut re = String::with_capacity(pattern.len() + 4);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| FilterError::InvalidRule {
        rule: pattern.to_owned(),
        reason: e.to_string(),
    })
}

impl Filter {
    pub fn new(config: &FilterConfig, force_replicate: bool) -> Result<Self, FilterError> {
        let raw = if config.rules.is_empty() {
            vec!["*.*".to_owned()]
        } else {
            config.rules.clone()
        };
        let mut rules = Vec::with_capacity(raw.len());
        for r in &raw {
            let (exclude, body) = match r.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, r.as_str()),
            };
            let (schema, table) = body.split_once('.').ok_or_else(|| FilterError::InvalidRule {
                rule: r.clone(),
                reason: "expected schema.table".to_owned(),
            })?;
            rules.push(Rule {
                exclude,
                schema: pattern_to_regex(schema)?,
                table: pattern_to_regex(table)?,
            });
        }
        Ok(Self {
            rules,
            force_replicate,
        })
    }

    pub fn force_replicate(&self) -> bool {
        self.force_replicate
    }

    /// Whether the table is excluded from replication.
    pub fn should_ignore_table(&self, schema: &str, table: &str) -> bool {
        let mut keep = false;
        for rule in &self.rules {
            if rule.schema.is_match(schema) && rule.table.is_match(table) {
                keep = !rule.exclude;
            }
        }
        !keep
    }

    /// Whether any table of the schema could be replicated.
    pub fn should_ignore_schema(&self, schema: &str) -> bool {
        let mut keep = false;
        for rule in &self.rules {
            if rule.schema.is_match(schema) {
                keep = !rule.exclude;
            }
        }
        !keep
    }

    /// Whether a DDL event should be dropped before reaching dispatchers.
    pub fn should_discard_ddl(&self, action: ActionType, schema: &str, table: &str) -> bool {
        match action {
            ActionType::CreateSchema | ActionType::DropSchema => {
                self.should_ignore_schema(schema)
            }
            // A view blocks everything; it is filtered by its own name.
            _ => self.should_ignore_table(schema, table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(rules: &[&str]) -> Filter {
        let config = FilterConfig {
            rules: rules.iter().map(|r| r.to_string()).collect(),
        };
        Filter::new(&config, false).unwrap()
    }

    #[test]
    fn test_default_rule_keeps_everything() {
        let f = filter(&[]);
        assert!(!f.should_ignore_table("any", "thing"));
    }

    #[test]
    fn test_last_match_wins() {
        let f = filter(&["test.*", "!test.skip_*"]);
        assert!(!f.should_ignore_table("test", "orders"));
        assert!(f.should_ignore_table("test", "skip_me"));
        assert!(f.should_ignore_table("other", "orders"));
    }

    #[test]
    fn test_discard_schema_level_ddl() {
        let f = filter(&["app.*"]);
        assert!(!f.should_discard_ddl(ActionType::DropSchema, "app", ""));
        assert!(f.should_discard_ddl(ActionType::DropSchema, "sys", ""));
        assert!(f.should_discard_ddl(ActionType::CreateTable, "sys", "t"));
    }
}
