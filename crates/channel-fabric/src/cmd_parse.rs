//! Text command dispatch for console-style input (`/rename Bob`).
//!
//! Names are matched in canonical form: lowercase, with `_` and `.` removed, so
//! `Set_Name`, `setname` and `set.name` all reach the same command.

use std::collections::HashMap;

/// A command handler. Receives the owner and the argument text (may be empty).
pub type CmdHandler<T> = fn(&mut T, &str) -> Result<String, String>;

pub enum CmdOutcome {
    /// No command by that name; the caller may try elsewhere.
    NotFound(String),
    Handled(Result<String, String>),
}

pub struct CmdParse<T> {
    cmds: HashMap<String, (String, CmdHandler<T>)>,
}

impl<T> Default for CmdParse<T> {
    fn default() -> Self {
        Self {
            cmds: HashMap::new(),
        }
    }
}

impl<T> Clone for CmdParse<T> {
    fn clone(&self) -> Self {
        Self {
            cmds: self.cmds.clone(),
        }
    }
}

pub fn canonical(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '.')
        .flat_map(char::to_lowercase)
        .collect()
}

impl<T> CmdParse<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`. Returns false if its canonical form is already taken.
    pub fn register(&mut self, name: &str, handler: CmdHandler<T>) -> bool {
        let key = canonical(name);
        if self.cmds.contains_key(&key) {
            return false;
        }
        self.cmds.insert(key, (name.to_string(), handler));
        true
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cmds.values().map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn handle(&self, owner: &mut T, input: &str) -> CmdOutcome {
        let input = input.trim();
        let (name, args) = match input.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim_start()),
            None => (input, ""),
        };
        if name.is_empty() {
            return CmdOutcome::NotFound("Missing command".to_string());
        }
        match self.cmds.get(&canonical(name)) {
            Some((_, handler)) => CmdOutcome::Handled(handler(owner, args)),
            None => CmdOutcome::NotFound(format!("Unknown command: \"{name}\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rename(owner: &mut String, args: &str) -> Result<String, String> {
        if args.is_empty() {
            return Err("Missing name".to_string());
        }
        *owner = args.to_string();
        Ok("Successfully renamed".to_string())
    }

    #[test]
    fn dispatches_by_canonical_name() {
        let mut cmds = CmdParse::new();
        assert!(cmds.register("set_name", rename));
        assert!(!cmds.register("SetName", rename));

        let mut owner = String::new();
        match cmds.handle(&mut owner, "Set.Name  Big Bob") {
            CmdOutcome::Handled(Ok(msg)) => assert_eq!(msg, "Successfully renamed"),
            _ => panic!("expected success"),
        }
        assert_eq!(owner, "Big Bob");
        assert!(matches!(
            cmds.handle(&mut owner, "setname"),
            CmdOutcome::Handled(Err(e)) if e == "Missing name"
        ));
    }

    #[test]
    fn reports_missing_and_unknown_commands() {
        let cmds: CmdParse<String> = CmdParse::new();
        let mut owner = String::new();
        assert!(matches!(
            cmds.handle(&mut owner, "   "),
            CmdOutcome::NotFound(e) if e == "Missing command"
        ));
        assert!(matches!(
            cmds.handle(&mut owner, "fly away"),
            CmdOutcome::NotFound(e) if e == "Unknown command: \"fly\""
        ));
    }
}
