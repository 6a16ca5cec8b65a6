// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod driver;

use crate::{Backend, Catalog, CatalogSettings, Entity, Executor, OpKind, Template, XMode};

/// A catalog of `templates` in the single mode `mode`.
pub(crate) fn catalog_of<B: Backend>(
    backend: &mut B,
    templates: &[(&str, Entity, OpKind)],
    mode: XMode,
) -> Catalog<B::Statement> {
    let templates: Vec<Template> = templates
        .iter()
        .map(|(base, entity, kind)| Template::new(*base, *entity, *kind))
        .collect();
    let settings = CatalogSettings::default().modes(vec![mode]);
    Catalog::from_templates(backend, &templates, &settings).unwrap()
}

/// Runs every operation of `catalog` in order, stopping at the first error.
pub(crate) fn run_all<B: Backend>(
    executor: &mut Executor<B>,
    catalog: &Catalog<B::Statement>,
    n: usize,
) -> Result<(), crate::ExecError> {
    let keys = crate::KeySet::new(n);
    for op in catalog.operations() {
        executor.execute(op, &keys)?;
    }
    Ok(())
}
