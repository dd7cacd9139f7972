//! Filter-expression parsing for `dump --filter`.
//!
//! Whitespace separates terms within a clause (disjunction), a bare `&`
//! token separates clauses (conjunction). Terms:
//!
//! * `field=value`   the field has this value
//! * `field!=value`  the field does not have this value
//! * `field=@path`   value read from a file
//! * `field=`        the field is empty
//!
//! Items resolve against the store being dumped, so a value the store never
//! saw becomes that field's overflow sentinel and the term matches nothing
//! (or everything, when negated).

use anyhow::{anyhow, Context};
use log::debug;

use crate::db::Db;
use crate::filter::EventFilter;

/// Parse `expression` into a filter resolved against `db`.
pub fn parse_filter(db: &Db, expression: &str) -> anyhow::Result<EventFilter> {
    let mut filter = EventFilter::new();
    for token in expression.split_whitespace() {
        if token == "&" {
            filter.new_clause();
            continue;
        }
        let (field_part, value_part, is_negative) = split_term(token)
            .ok_or_else(|| anyhow!("term '{token}' is missing '=' in filter '{expression}'"))?;
        let field = db
            .get_field(field_part)
            .with_context(|| format!("unknown field '{field_part}' in filter '{expression}'"))?;
        let item = if let Some(path) = value_part.strip_prefix('@') {
            let bytes = std::fs::read(path)
                .with_context(|| format!("cannot read filter value file '{path}'"))?;
            db.get_item(field, &bytes)?
        } else {
            db.get_item(field, value_part.as_bytes())?
        };
        debug!("filter term: field={field_part} item={item} negative={is_negative}");
        filter.add_term(item, is_negative);
    }
    Ok(filter)
}

/// Split one term into `(field, value, negated)`.
fn split_term(token: &str) -> Option<(&str, &str, bool)> {
    let eq = token.find('=')?;
    if eq > 0 && token.as_bytes()[eq - 1] == b'!' {
        Some((&token[..eq - 1], &token[eq + 1..], true))
    } else {
        Some((&token[..eq], &token[eq + 1..], false))
    }
}
