use std::collections::HashMap;

use crate::error::ProtocolError;
use crate::types::stringify;

/// A named prepared statement plus whatever parameters are currently bound
/// to it. Created by Parse, rebound by Bind, read by Execute. Lives and
/// dies with its session.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub query: String,
    pub param_type_oids: Vec<i32>,
    pub param_format_codes: Vec<i16>,
    pub bound_params: Vec<Option<Vec<u8>>>,
}

impl Statement {
    pub fn new(query: String, param_type_oids: Vec<i32>) -> Statement {
        Statement {
            query,
            param_type_oids,
            param_format_codes: Vec::new(),
            bound_params: Vec::new(),
        }
    }

    /// Substitute `$1..$N` placeholders with the bound values, rendered
    /// through the type stringifier and single-quoted. The scan is
    /// token-aware so `$1` is never clipped out of `$10`. Audit output
    /// only; the result is never sent anywhere for execution.
    pub fn interpolate(&self) -> String {
        let src = self.query.as_bytes();
        let mut out = Vec::with_capacity(src.len());
        let mut i = 0;
        while i < src.len() {
            if src[i] == b'$' {
                let mut j = i + 1;
                while j < src.len() && src[j].is_ascii_digit() {
                    j += 1;
                }
                if j > i + 1 {
                    if let Ok(index) = self.query[i + 1..j].parse::<usize>() {
                        if index >= 1 && index <= self.bound_params.len() {
                            out.extend_from_slice(self.render_param(index).as_bytes());
                            i = j;
                            continue;
                        }
                    }
                }
            }
            out.push(src[i]);
            i += 1;
        }
        String::from_utf8_lossy(&out).to_string()
    }

    fn render_param(&self, index: usize) -> String {
        let oid = self.param_type_oids.get(index - 1).copied().unwrap_or(0);
        match &self.bound_params[index - 1] {
            Some(bytes) => format!("'{}'", stringify(oid, bytes)),
            None => "NULL".to_string(),
        }
    }
}

/// Per-session table of prepared statements, keyed by statement name.
/// Owned by exactly one session; dropped with it.
#[derive(Debug, Default)]
pub struct StatementTracker {
    statements: HashMap<String, Statement>,
}

impl StatementTracker {
    pub fn new() -> StatementTracker {
        StatementTracker {
            statements: HashMap::new(),
        }
    }

    /// Parse inserts or replaces; format codes and bound values start empty.
    pub fn on_parse(&mut self, name: &str, sql: &str, param_type_oids: &[i32]) {
        self.statements.insert(
            name.to_string(),
            Statement::new(sql.to_string(), param_type_oids.to_vec()),
        );
    }

    /// Bind replaces the format codes and bound values of an existing
    /// statement, leaving the query and declared types untouched.
    pub fn on_bind(
        &mut self,
        name: &str,
        param_format_codes: &[i16],
        param_values: &[Option<Vec<u8>>],
    ) -> Result<(), ProtocolError> {
        let statement = self
            .statements
            .get_mut(name)
            .ok_or_else(|| ProtocolError::UnknownStatement(name.to_string()))?;
        statement.param_format_codes = param_format_codes.to_vec();
        statement.bound_params = param_values.to_vec();
        Ok(())
    }

    pub fn on_execute(&self, name: &str) -> Result<&Statement, ProtocolError> {
        self.statements
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownStatement(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
