//! Include/exclude decisions.

use regex::RegexSet;

/// Decides which classes get instrumented. Exclusion is checked first and
/// wins; a class is only touched when it is also explicitly included.
///
/// Class names are dotted (`com.example.Foo`).
pub trait InclusionPolicy: Send + Sync {
    fn is_excluded(&self, class_name: &str) -> bool;
    fn is_included(&self, class_name: &str) -> bool;
}

/// Package of the agent's own classes, never instrumented.
pub const AGENT_PACKAGE: &str = "delver.";

/// Regex patterns matched against the whole dotted class name.
#[derive(Debug, Clone)]
pub struct PatternPolicy {
    include: RegexSet,
    exclude: RegexSet,
}

impl PatternPolicy {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, regex::Error>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            include: anchored(include)?,
            exclude: anchored(exclude)?,
        })
    }
}

fn anchored<P>(patterns: P) -> Result<RegexSet, regex::Error>
where
    P: IntoIterator,
    P::Item: AsRef<str>,
{
    RegexSet::new(patterns.into_iter().map(|p| format!("^(?:{})$", p.as_ref())))
}

impl InclusionPolicy for PatternPolicy {
    fn is_excluded(&self, class_name: &str) -> bool {
        class_name.starts_with(AGENT_PACKAGE) || self.exclude.is_match(class_name)
    }

    fn is_included(&self, class_name: &str) -> bool {
        self.include.is_match(class_name)
    }
}
