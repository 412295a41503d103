//! Parameter placeholder substitution.
//!
//! `execute` accepts SQL with `%s` (positional) or `%(name)s` (named)
//! placeholders, rewrites them to `@P1…@Pn`, and produces the ordered
//! parameter list plus the sp_executesql declaration string. `%%` is a
//! literal percent. A repeated named placeholder reuses its parameter.

use std::collections::HashMap;

use tidewire_proto::value::Value;
use tidewire_proto::version::TdsVersion;

use crate::error::Error;

/// Parameters for `execute`: positional for `%s`, named for `%(name)s`.
#[derive(Debug, Clone)]
pub enum Params {
    /// Values consumed left to right by `%s` placeholders.
    Positional(Vec<Value>),
    /// Values looked up by `%(name)s` placeholders.
    Named(HashMap<String, Value>),
}

impl Params {
    /// True when there is nothing to substitute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(v) => v.is_empty(),
            Self::Named(m) => m.is_empty(),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(v: Vec<Value>) -> Self {
        Self::Positional(v)
    }
}

impl From<HashMap<String, Value>> for Params {
    fn from(m: HashMap<String, Value>) -> Self {
        Self::Named(m)
    }
}

/// The outcome of placeholder substitution.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    /// SQL with placeholders rewritten to `@P1…@Pn`.
    pub sql: String,
    /// Values in `@P1…@Pn` order.
    pub values: Vec<Value>,
}

impl BoundQuery {
    /// The sp_executesql parameter-definition string, one declaration per
    /// parameter (`@P1 int,@P2 nvarchar(12)`).
    #[must_use]
    pub fn declarations(&self, version: TdsVersion) -> String {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| format!("@P{} {}", i + 1, v.infer_type(version).declaration()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Rewrite `%s` / `%(name)s` placeholders to `@P1…@Pn`.
pub fn substitute(sql: &str, params: &Params) -> Result<BoundQuery, Error> {
    let mut out = String::with_capacity(sql.len() + 16);
    let mut values: Vec<Value> = Vec::new();
    let mut named_slots: HashMap<String, usize> = HashMap::new();
    let mut positional_used = 0usize;

    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => {
                let Params::Positional(list) = params else {
                    return Err(Error::Programming {
                        number: 0,
                        message: "positional placeholder with named parameters".into(),
                    });
                };
                let value = list.get(positional_used).ok_or_else(|| Error::Programming {
                    number: 0,
                    message: format!("not enough parameters for placeholder {}", positional_used + 1),
                })?;
                positional_used += 1;
                values.push(value.clone());
                out.push_str(&format!("@P{}", values.len()));
            }
            Some('(') => {
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == ')' {
                        break;
                    }
                    name.push(c);
                }
                match chars.next() {
                    Some('s') => {}
                    _ => {
                        return Err(Error::Programming {
                            number: 0,
                            message: format!("named placeholder %({name})… must end with 's'"),
                        });
                    }
                }
                let Params::Named(map) = params else {
                    return Err(Error::Programming {
                        number: 0,
                        message: "named placeholder with positional parameters".into(),
                    });
                };
                let slot = match named_slots.get(&name) {
                    Some(&slot) => slot,
                    None => {
                        let value = map.get(&name).ok_or_else(|| Error::Programming {
                            number: 0,
                            message: format!("no parameter named {name:?}"),
                        })?;
                        values.push(value.clone());
                        let slot = values.len();
                        named_slots.insert(name.clone(), slot);
                        slot
                    }
                };
                out.push_str(&format!("@P{slot}"));
            }
            Some(other) => {
                return Err(Error::Programming {
                    number: 0,
                    message: format!("unsupported format character {other:?}"),
                });
            }
            None => {
                return Err(Error::Programming {
                    number: 0,
                    message: "dangling '%' at end of statement".into(),
                });
            }
        }
    }

    Ok(BoundQuery { sql: out, values })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn positional_rewrite() {
        let bound = substitute(
            "select * from t where a = %s and b = %s",
            &Params::Positional(vec![Value::I32(1), Value::from("x")]),
        )
        .unwrap();
        assert_eq!(bound.sql, "select * from t where a = @P1 and b = @P2");
        assert_eq!(bound.values.len(), 2);
    }

    #[test]
    fn named_rewrite_reuses_slots() {
        let mut map = HashMap::new();
        map.insert("id".to_owned(), Value::I32(7));
        let bound = substitute(
            "select %(id)s where x = %(id)s",
            &Params::Named(map),
        )
        .unwrap();
        assert_eq!(bound.sql, "select @P1 where x = @P1");
        assert_eq!(bound.values, vec![Value::I32(7)]);
    }

    #[test]
    fn double_percent_is_literal() {
        let bound = substitute(
            "select '100%%' where a = %s",
            &Params::Positional(vec![Value::I32(1)]),
        )
        .unwrap();
        assert_eq!(bound.sql, "select '100%' where a = @P1");
    }

    #[test]
    fn missing_parameter_is_a_programming_error() {
        let err = substitute("select %s", &Params::Positional(vec![])).unwrap_err();
        assert!(matches!(err, Error::Programming { .. }));
    }

    #[test]
    fn unknown_format_character_is_rejected() {
        assert!(substitute("select %d", &Params::Positional(vec![Value::I32(1)])).is_err());
    }

    #[test]
    fn declarations_follow_inference() {
        let bound = substitute(
            "select %s, %s",
            &Params::Positional(vec![Value::I32(1), Value::from("ab")]),
        )
        .unwrap();
        let decls = bound.declarations(TdsVersion::V7_4);
        assert_eq!(decls, "@P1 int,@P2 nvarchar(2)");
    }
}
