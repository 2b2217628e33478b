//! Association resolution
//!
//! Turns the raw declarations collected on the schema builders into
//! concrete edges: infers target models from aliases, derives foreign-key
//! column names, and materializes the foreign-key columns on the owning
//! builders.

use std::collections::HashMap;

use crate::error::{OrmError, OrmResult};
use crate::schema::{ColumnSchema, ColumnType, SchemaBuilder};

use super::{Association, AssociationType};

/// Convert a model name to its snake_case spelling
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Convert a snake_case alias to a PascalCase model name
pub fn camelize(name: &str) -> String {
    name.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Naive singular form of a plural alias
pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{stem}y");
    }
    if word.ends_with("ss") {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix('s') {
        return stem.to_string();
    }
    word.to_string()
}

/// Resolve every declared association across the model graph.
///
/// Returns the resolved edges keyed by source model. Foreign-key columns
/// that do not exist yet are added to the owning builder as nullable
/// record-id columns.
pub fn resolve_associations(
    builders: &mut HashMap<String, SchemaBuilder>,
) -> OrmResult<HashMap<String, Vec<Association>>> {
    let mut resolved: HashMap<String, Vec<Association>> = HashMap::new();
    let mut pending_columns: Vec<(String, String)> = Vec::new();

    let mut model_names: Vec<String> = builders.keys().cloned().collect();
    model_names.sort();

    for source in &model_names {
        let decls = builders[source].associations.clone();
        let mut edges = Vec::with_capacity(decls.len());
        for decl in decls {
            let target = match &decl.target_model {
                Some(target) => target.clone(),
                None => match decl.association_type {
                    AssociationType::HasMany => camelize(&singularize(&decl.alias)),
                    AssociationType::HasOne | AssociationType::BelongsTo => camelize(&decl.alias),
                },
            };
            if !builders.contains_key(&target) {
                return Err(OrmError::backend_message(format!(
                    "association '{}' on model '{source}' references unknown model '{target}'",
                    decl.alias
                )));
            }
            let foreign_key = match &decl.foreign_key {
                Some(fk) => fk.clone(),
                None => match decl.association_type {
                    AssociationType::HasMany | AssociationType::HasOne => {
                        format!("{}_id", snake_case(source))
                    }
                    AssociationType::BelongsTo => format!("{}_id", decl.alias),
                },
            };
            let owner = match decl.association_type {
                AssociationType::HasMany | AssociationType::HasOne => target.clone(),
                AssociationType::BelongsTo => source.clone(),
            };
            pending_columns.push((owner, foreign_key.clone()));
            edges.push(Association {
                association_type: decl.association_type,
                source_model: source.clone(),
                target_model: target,
                foreign_key,
                alias: decl.alias,
                integrity: decl.integrity,
            });
        }
        resolved.insert(source.clone(), edges);
    }

    for (owner, column) in pending_columns {
        let builder = builders
            .get_mut(&owner)
            .ok_or_else(|| OrmError::backend_message(format!("unknown model '{owner}'")))?;
        if !builder.columns.iter().any(|c| c.name == column) {
            builder
                .columns
                .push(ColumnSchema::new(&column, ColumnType::RecordId));
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationships::IntegrityPolicy;
    use crate::schema::AssociationOptions;

    fn builders() -> HashMap<String, SchemaBuilder> {
        let mut map = HashMap::new();
        let mut user = SchemaBuilder::new("User", "users");
        user.column("name", ColumnType::String(None));
        user.has_many("posts", AssociationOptions::integrity(IntegrityPolicy::Delete));
        map.insert("User".to_string(), user);
        let mut post = SchemaBuilder::new("Post", "posts");
        post.column("body", ColumnType::Text);
        post.belongs_to("user", AssociationOptions::default());
        map.insert("Post".to_string(), post);
        map
    }

    #[test]
    fn infers_target_and_foreign_key() {
        let mut builders = builders();
        let resolved = resolve_associations(&mut builders).unwrap();
        let edge = &resolved["User"][0];
        assert_eq!(edge.target_model, "Post");
        assert_eq!(edge.foreign_key, "user_id");
        assert_eq!(edge.integrity, IntegrityPolicy::Delete);
        // The foreign key materialized on the Post builder
        assert!(builders["Post"].columns.iter().any(|c| c.name == "user_id"));
    }

    #[test]
    fn unknown_target_model_fails() {
        let mut builders = HashMap::new();
        let mut user = SchemaBuilder::new("User", "users");
        user.has_many("ghosts", AssociationOptions::default());
        builders.insert("User".to_string(), user);
        assert!(resolve_associations(&mut builders).is_err());
    }

    #[test]
    fn inflection_helpers() {
        assert_eq!(snake_case("BlogPost"), "blog_post");
        assert_eq!(camelize("blog_post"), "BlogPost");
        assert_eq!(singularize("entries"), "entry");
        assert_eq!(singularize("posts"), "post");
        assert_eq!(singularize("glass"), "glass");
    }
}
