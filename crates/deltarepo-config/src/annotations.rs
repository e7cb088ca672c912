//! Field docs of the config structs rendered as comments of the generated
//! `config.toml`.

use std::any::type_name;

use documented::{Documented, DocumentedFields};
use toml_edit::{ArrayOfTables, Decor, Item, RawString, Table};
use tracing::debug;

use crate::error::{ConfigError, Result};

/// Renders `docs` as `#` comment lines. Blank doc lines become a bare `#`.
fn comment_block(docs: &str) -> String {
    docs.lines()
        .map(|line| {
            match line.trim_end() {
                "" => "#\n".to_string(),
                line => format!("# {line}\n"),
            }
        })
        .collect()
}

/// Adds `docs` to the comments above a TOML item. An existing comment is
/// kept and separated from the new one by an empty `#` line.
pub fn append_docs_as_toml_comments(decor: &mut Decor, docs: &str) {
    let comments = comment_block(docs);
    let prefix = match decor.prefix().and_then(RawString::as_str) {
        None | Some("") => comments,
        Some(existing) if existing.lines().last().is_none_or(|l| l.trim().is_empty()) => {
            format!("{existing}{comments}")
        }
        Some(existing) => format!("{existing}#\n{comments}"),
    };
    decor.set_prefix(prefix);
}

/// Comments every key of `table` with the doc of the matching field of `T`.
/// The struct doc of `T` goes above the table header unless it's the
/// document root, which has no header.
pub fn annotate_toml_table<T>(table: &mut Table, is_root: bool) -> Result<()>
where
    T: Documented + DocumentedFields,
{
    if !is_root {
        append_docs_as_toml_comments(table.decor_mut(), T::DOCS);
    }

    for (mut key, item) in table.iter_mut() {
        let name = key.get().to_string();
        let Ok(docs) = T::get_field_docs(&name) else {
            debug!("No docs for '{name}' in {}", type_name::<T>());
            continue;
        };

        match item {
            Item::None => return Err(ConfigError::UnexpectedTomlItem(name)),
            Item::Value(_) => append_docs_as_toml_comments(key.leaf_decor_mut(), docs),
            Item::Table(nested) => append_docs_as_toml_comments(nested.decor_mut(), docs),
            Item::ArrayOfTables(array) => {
                if let Some(first) = array.iter_mut().next() {
                    append_docs_as_toml_comments(first.decor_mut(), docs);
                }
            }
        }
    }

    Ok(())
}

/// Documents an array of tables through its first entry. Later entries
/// share the same fields and stay uncommented.
pub fn annotate_toml_array_of_tables<T>(array: &mut ArrayOfTables) -> Result<()>
where
    T: Documented + DocumentedFields,
{
    match array.iter_mut().next() {
        Some(first) => annotate_toml_table::<T>(first, false),
        None => Ok(()),
    }
}
