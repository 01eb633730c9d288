// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filter rule categories and the allow/block tabs that group them.

use std::fmt;

use crate::model::Rule;

/// Wildcard rules are stored as regexes matching the domain and any subdomain.
pub const WILDCARD_REGEX_PREFIX: &str = r"(\.|^)";
pub const WILDCARD_REGEX_SUFFIX: &str = "$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCategory {
    White,
    Black,
    RegexWhite,
    RegexBlack,
}

impl RuleCategory {
    /// Fetch order used by the filter rules view: allow rules first, exact before regex.
    pub const FETCH_ORDER: [RuleCategory; 4] = [
        RuleCategory::White,
        RuleCategory::RegexWhite,
        RuleCategory::Black,
        RuleCategory::RegexBlack,
    ];

    /// List name understood by the appliance's query API.
    pub fn list_name(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Black => "black",
            Self::RegexWhite => "regex_white",
            Self::RegexBlack => "regex_black",
        }
    }

    pub fn is_regex(self) -> bool {
        matches!(self, Self::RegexWhite | Self::RegexBlack)
    }

    pub fn tab(self) -> RuleTab {
        match self {
            Self::White | Self::RegexWhite => RuleTab::Allow,
            Self::Black | Self::RegexBlack => RuleTab::Block,
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::White => "WHITE",
            Self::Black => "BLACK",
            Self::RegexWhite => "REGEX_WHITE",
            Self::RegexBlack => "REGEX_BLACK",
        };
        f.write_str(name)
    }
}

/// Tab of the filter rules view. Doubles as the predicate selecting which rules it shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RuleTab {
    #[default]
    Allow,
    Block,
}

impl RuleTab {
    pub fn categories(self) -> [RuleCategory; 2] {
        match self {
            Self::Allow => [RuleCategory::White, RuleCategory::RegexWhite],
            Self::Block => [RuleCategory::Black, RuleCategory::RegexBlack],
        }
    }

    pub fn contains(self, category: RuleCategory) -> bool {
        category.tab() == self
    }

    /// Category a new rule added from this tab ends up in.
    pub fn category_for(self, wildcard: bool) -> RuleCategory {
        match (self, wildcard) {
            (Self::Allow, false) => RuleCategory::White,
            (Self::Allow, true) => RuleCategory::RegexWhite,
            (Self::Block, false) => RuleCategory::Black,
            (Self::Block, true) => RuleCategory::RegexBlack,
        }
    }

    pub fn filter<'a>(self, rules: &'a [Rule]) -> impl Iterator<Item = &'a Rule> + 'a {
        rules.iter().filter(move |rule| self.contains(rule.category))
    }
}

/// Turns `example.com` into a regex matching it and all of its subdomains.
pub fn wildcard_regex(domain: &str) -> String {
    format!(
        "{WILDCARD_REGEX_PREFIX}{}{WILDCARD_REGEX_SUFFIX}",
        domain.replace('.', r"\.")
    )
}
