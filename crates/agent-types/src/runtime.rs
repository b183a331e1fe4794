use std::fmt;

/// The closed set of runtimes the agent knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Python,
    Cpp,
    NodeJs,
    Go,
}

impl RuntimeKind {
    /// Resolve a task's free-form `runtime` string, accepting the aliases
    /// documented in the task schema (`c++`, `node`/`javascript`/`js`, `golang`).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "python" => Some(Self::Python),
            "cpp" | "c++" => Some(Self::Cpp),
            "nodejs" | "node" | "javascript" | "js" => Some(Self::NodeJs),
            "go" | "golang" => Some(Self::Go),
            _ => None,
        }
    }

    /// Canonical lowercase form, used for metrics dimensions and warm-pool keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Cpp => "cpp",
            Self::NodeJs => "nodejs",
            Self::Go => "go",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
