//! Dependency-aware ordering of descriptors within a phase.

use std::collections::BTreeSet;

use anyhow::{Result, anyhow};

use super::descriptor::ServiceDescriptor;

/// Order `services` so each comes after the `depends_on` targets that are part
/// of the same slice; everything else keeps declaration order.
///
/// Dependencies outside the slice (another phase, or an external service) are
/// ignored here. Errors if the in-slice dependencies form a cycle.
pub fn dependency_order<'a>(services: &[ServiceDescriptor<'a>]) -> Result<Vec<ServiceDescriptor<'a>>> {
    let names: BTreeSet<&str> = services.iter().map(|s| s.name()).collect();
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut remaining: Vec<ServiceDescriptor<'a>> = services.to_vec();
    let mut ordered = Vec::with_capacity(services.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|service| {
            service
                .depends_on()
                .iter()
                .filter(|dep| names.contains(dep.as_str()))
                .all(|dep| placed.contains(dep.as_str()))
        });
        let Some(index) = ready else {
            let stuck: Vec<&str> = remaining.iter().map(|s| s.name()).collect();
            return Err(anyhow!("dependency cycle among: {}", stuck.join(", ")));
        };
        let service = remaining.remove(index);
        placed.insert(service.name());
        ordered.push(service);
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::ContainerDescriptor;
    use crate::test_support::container;

    fn depends(mut desc: ContainerDescriptor, deps: &[&str]) -> ContainerDescriptor {
        desc.depends_on = deps.iter().map(|d| d.to_string()).collect();
        desc
    }

    fn names(ordered: &[ServiceDescriptor<'_>]) -> Vec<String> {
        ordered.iter().map(|s| s.name().to_string()).collect()
    }

    #[test]
    fn keeps_declaration_order_without_dependencies() {
        let a = container("a", "a:1");
        let b = container("b", "b:1");
        let ordered =
            dependency_order(&[ServiceDescriptor::Container(&a), ServiceDescriptor::Container(&b)])
                .expect("order");
        assert_eq!(names(&ordered), vec!["a", "b"]);
    }

    #[test]
    fn moves_dependents_after_their_dependencies() {
        let ghost = depends(container("ghost", "ghost:5"), &["mysql"]);
        let mysql = container("mysql", "mysql:8.0");
        let redis = container("redis", "redis:7");
        let ordered = dependency_order(&[
            ServiceDescriptor::Container(&ghost),
            ServiceDescriptor::Container(&mysql),
            ServiceDescriptor::Container(&redis),
        ])
        .expect("order");
        assert_eq!(names(&ordered), vec!["mysql", "ghost", "redis"]);
    }

    #[test]
    fn ignores_dependencies_outside_the_slice() {
        let app = depends(container("app", "app:1"), &["postgres"]);
        let ordered = dependency_order(&[ServiceDescriptor::Container(&app)]).expect("order");
        assert_eq!(names(&ordered), vec!["app"]);
    }

    #[test]
    fn reports_cycles() {
        let a = depends(container("a", "a:1"), &["b"]);
        let b = depends(container("b", "b:1"), &["a"]);
        let err = dependency_order(&[ServiceDescriptor::Container(&a), ServiceDescriptor::Container(&b)])
            .expect_err("cycle");
        assert!(err.to_string().contains("dependency cycle among: a, b"));
    }
}
