use std::collections::{BTreeMap, BTreeSet};

use kube::{
    ResourceExt,
    api::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    core::{Expression, Selector, SelectorExt},
};
use kubefleet_apis::ResourceKind;

use crate::errors::{Error, Result};

pub fn api_resource(kind: ResourceKind) -> Result<ApiResource> {
    let info = kind
        .info()
        .ok_or_else(|| Error::Unsupported(format!("{} is not a kubernetes kind", kind)))?;
    let gvk = GroupVersionKind::gvk(info.group, info.version, info.kind);
    Ok(ApiResource::from_gvk_with_plural(&gvk, info.plural))
}

pub fn type_meta(kind: ResourceKind) -> Result<TypeMeta> {
    let ar = api_resource(kind)?;
    Ok(TypeMeta {
        api_version: ar.api_version,
        kind: ar.kind,
    })
}

/// An empty object of `kind` named `name`.
pub fn new_object(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
    let ar = api_resource(kind)?;
    let mut object = DynamicObject::new(name, &ar);
    if kind.is_namespaced() {
        object.metadata.namespace = namespace.map(|ns| ns.to_string());
    }
    Ok(object)
}

pub fn stamp_types(kind: ResourceKind, mut object: DynamicObject) -> Result<DynamicObject> {
    if object.types.is_none() {
        object.types = Some(type_meta(kind)?);
    }
    Ok(object)
}

/// `metadata.resourceVersion` as a number, 0 if absent or opaque.
pub fn resource_version(object: &DynamicObject) -> u64 {
    object
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub fn object_ident(kind: ResourceKind, object: &DynamicObject) -> String {
    match object.namespace() {
        Some(ns) => format!("{} {}/{}", kind, ns, object.name_any()),
        None => format!("{} {}", kind, object.name_any()),
    }
}

/// Parses a label selector string into kube's [`Selector`].
///
/// Accepts `a=b`, `a==b`, `a!=b`, `a`, `!a`, `a in (b,c)` and
/// `a notin (b,c)`, comma separated.
pub fn parse_selector(selector: &str) -> Result<Selector> {
    let mut expressions = vec![];
    let mut rest = selector.trim();
    while !rest.is_empty() {
        let (term, tail) = split_term(rest)?;
        expressions.push(parse_expression(term.trim(), selector)?);
        rest = tail.trim();
    }
    Ok(expressions.into_iter().collect())
}

/// Splits off the first term at a comma outside parentheses.
fn split_term(input: &str) -> Result<(&str, &str)> {
    let mut depth = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    Error::Validation(format!("unbalanced label selector {:?}", input))
                })?
            }
            ',' if depth == 0 => return Ok((&input[..i], &input[i + 1..])),
            _ => (),
        }
    }
    if depth != 0 {
        return Err(Error::Validation(format!(
            "unbalanced label selector {:?}",
            input
        )));
    }
    Ok((input, ""))
}

fn parse_expression(term: &str, selector: &str) -> Result<Expression> {
    let invalid = || Error::Validation(format!("invalid label selector {:?}", selector));
    let mut words = term.split_whitespace();
    if let (Some(key), Some(op)) = (words.next(), words.next()) {
        if op == "in" || op == "notin" {
            let values = term[term.find('(').ok_or_else(invalid)? + 1..]
                .strip_suffix(')')
                .ok_or_else(invalid)?
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect::<BTreeSet<_>>();
            return Ok(if op == "in" {
                Expression::In(key.to_string(), values)
            } else {
                Expression::NotIn(key.to_string(), values)
            });
        }
    }
    let key = |k: &str| {
        let k = k.trim();
        if k.is_empty() || k.contains(char::is_whitespace) {
            Err(invalid())
        } else {
            Ok(k.to_string())
        }
    };
    if let Some((k, v)) = term.split_once("!=") {
        Ok(Expression::NotEqual(key(k)?, v.trim().to_string()))
    } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
        Ok(Expression::Equal(key(k)?, v.trim().to_string()))
    } else if let Some(k) = term.strip_prefix('!') {
        Ok(Expression::DoesNotExist(key(k)?))
    } else {
        Ok(Expression::Exists(key(term)?))
    }
}

pub fn selector_matches(labels: &BTreeMap<String, String>, selector: &Selector) -> bool {
    selector.matches(labels)
}
