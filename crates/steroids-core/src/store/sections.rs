//! Sections: ordered buckets of tasks with a dependency DAG.

use std::collections::{HashMap, HashSet};

use sqlx::Row;
use uuid::Uuid;

use super::TaskStore;
use crate::{Error, Result};

/// A named, ordered bucket of tasks.
#[derive(Debug, Clone)]
pub struct Section {
    /// Identifier.
    pub id: String,
    /// Display name, unique per project.
    pub name: String,
    /// Ordinal position; total order, not necessarily contiguous.
    pub position: i64,
    /// 0 highest to 100 lowest.
    pub priority: i64,
    /// Skipped sections never schedule.
    pub skipped: bool,
}

fn section_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Section> {
    let skipped: i64 = row
        .try_get("skipped")
        .map_err(|e| Error::Database(format!("field 'skipped': {e}")))?;
    Ok(Section {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("field 'id': {e}")))?,
        name: row
            .try_get("name")
            .map_err(|e| Error::Database(format!("field 'name': {e}")))?,
        position: row
            .try_get("position")
            .map_err(|e| Error::Database(format!("field 'position': {e}")))?,
        priority: row
            .try_get("priority")
            .map_err(|e| Error::Database(format!("field 'priority': {e}")))?,
        skipped: skipped != 0,
    })
}

impl TaskStore {
    /// Create a section.
    pub async fn create_section(&self, name: &str, position: i64, priority: i64) -> Result<Section> {
        if name.trim().is_empty() {
            return Err(Error::Validation("section name cannot be empty".into()));
        }
        if !(0..=100).contains(&priority) {
            return Err(Error::Validation(format!(
                "section priority must be 0..=100, got {priority}"
            )));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sections (id, name, position, priority) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&id)
        .bind(name)
        .bind(position)
        .bind(priority)
        .execute(self.pool())
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint failed") {
                Error::Validation(format!("section '{name}' already exists"))
            } else {
                Error::Database(format!("failed to insert section: {e}"))
            }
        })?;

        self.get_section(&id).await
    }

    /// Fetch a section by id.
    pub async fn get_section(&self, id: &str) -> Result<Section> {
        let row = sqlx::query(
            "SELECT id, name, position, priority, skipped FROM sections WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to fetch section: {e}")))?
        .ok_or_else(|| Error::SectionNotFound(id.to_string()))?;
        section_from_row(&row)
    }

    /// List all sections by position.
    pub async fn list_sections(&self) -> Result<Vec<Section>> {
        let rows = sqlx::query(
            "SELECT id, name, position, priority, skipped FROM sections ORDER BY position ASC",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to list sections: {e}")))?;
        rows.iter().map(section_from_row).collect()
    }

    /// Resolve a section by exact id, exact name, or unambiguous name
    /// prefix. An ambiguous prefix fails with every match listed.
    pub async fn resolve_section(&self, reference: &str) -> Result<Section> {
        if let Ok(section) = self.get_section(reference).await {
            return Ok(section);
        }

        let sections = self.list_sections().await?;
        if let Some(exact) = sections.iter().find(|s| s.name == reference) {
            return Ok(exact.clone());
        }

        let matches: Vec<&Section> = sections
            .iter()
            .filter(|s| s.name.starts_with(reference))
            .collect();
        match matches.as_slice() {
            [] => Err(Error::SectionNotFound(reference.to_string())),
            [one] => Ok((*one).clone()),
            many => Err(Error::AmbiguousSection {
                prefix: reference.to_string(),
                matches: many.iter().map(|s| s.name.clone()).collect(),
            }),
        }
    }

    /// Mark a section skipped or unskipped.
    pub async fn set_section_skipped(&self, id: &str, skipped: bool) -> Result<()> {
        let result = sqlx::query("UPDATE sections SET skipped = ?1 WHERE id = ?2")
            .bind(i64::from(skipped))
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to update section: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(Error::SectionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Add a dependency edge `section -> depends_on`, rejecting edges
    /// that would close a cycle.
    pub async fn add_section_dependency(&self, section_id: &str, depends_on: &str) -> Result<()> {
        if section_id == depends_on {
            return Err(Error::CyclicDependency(format!(
                "section {section_id} cannot depend on itself"
            )));
        }
        self.get_section(section_id).await?;
        self.get_section(depends_on).await?;

        // The new edge closes a cycle iff depends_on already reaches
        // section_id through existing edges.
        let edges = self.dependency_edges().await?;
        if reaches(&edges, depends_on, section_id) {
            return Err(Error::CyclicDependency(format!(
                "adding {section_id} -> {depends_on} would create a cycle"
            )));
        }

        sqlx::query(
            "INSERT OR IGNORE INTO section_dependencies (section_id, depends_on) VALUES (?1, ?2)",
        )
        .bind(section_id)
        .bind(depends_on)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to insert dependency: {e}")))?;
        Ok(())
    }

    /// Remove a dependency edge.
    pub async fn remove_section_dependency(
        &self,
        section_id: &str,
        depends_on: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM section_dependencies WHERE section_id = ?1 AND depends_on = ?2",
        )
        .bind(section_id)
        .bind(depends_on)
        .execute(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to remove dependency: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    /// All dependency edges as `section_id -> [depends_on]`.
    pub async fn dependency_edges(&self) -> Result<HashMap<String, Vec<String>>> {
        let rows = sqlx::query("SELECT section_id, depends_on FROM section_dependencies")
            .fetch_all(self.pool())
            .await
            .map_err(|e| Error::Database(format!("failed to list dependencies: {e}")))?;

        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let from: String = row
                .try_get("section_id")
                .map_err(|e| Error::Database(format!("field 'section_id': {e}")))?;
            let to: String = row
                .try_get("depends_on")
                .map_err(|e| Error::Database(format!("field 'depends_on': {e}")))?;
            edges.entry(from).or_default().push(to);
        }
        Ok(edges)
    }

    /// A section is dependency-met iff every section it depends on has
    /// zero tasks whose status is not `completed`.
    pub async fn dependencies_met(&self, section_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS blocking FROM section_dependencies d
             JOIN tasks t ON t.section_id = d.depends_on
             WHERE d.section_id = ?1 AND t.status != 'completed'",
        )
        .bind(section_id)
        .fetch_one(self.pool())
        .await
        .map_err(|e| Error::Database(format!("failed to check dependencies: {e}")))?;
        let blocking: i64 = row
            .try_get("blocking")
            .map_err(|e| Error::Database(format!("field 'blocking': {e}")))?;
        Ok(blocking == 0)
    }
}

/// Iterative DFS over the adjacency map: can `from` reach `to`?
fn reaches(edges: &HashMap<String, Vec<String>>, from: &str, to: &str) -> bool {
    let mut stack = vec![from];
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = edges.get(node) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TaskStore {
        TaskStore::open_in_memory()
            .await
            .unwrap_or_else(|e| panic!("in-memory store: {e}"))
    }

    #[tokio::test]
    async fn test_cycle_rejected() -> Result<()> {
        let store = store().await;
        let a = store.create_section("a", 0, 50).await?;
        let b = store.create_section("b", 1, 50).await?;
        let c = store.create_section("c", 2, 50).await?;

        store.add_section_dependency(&a.id, &b.id).await?;
        store.add_section_dependency(&b.id, &c.id).await?;

        // c -> a would close a three-node cycle.
        let result = store.add_section_dependency(&c.id, &a.id).await;
        assert!(matches!(result, Err(Error::CyclicDependency(_))));

        // Self-dependency is the degenerate cycle.
        let result = store.add_section_dependency(&a.id, &a.id).await;
        assert!(matches!(result, Err(Error::CyclicDependency(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_two_node_cycle_rejected() -> Result<()> {
        let store = store().await;
        let a = store.create_section("alpha", 0, 50).await?;
        let b = store.create_section("beta", 1, 50).await?;
        store.add_section_dependency(&a.id, &b.id).await?;
        let result = store.add_section_dependency(&b.id, &a.id).await;
        assert!(matches!(result, Err(Error::CyclicDependency(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_prefix_resolution() -> Result<()> {
        let store = store().await;
        store.create_section("auth-api", 0, 50).await?;
        store.create_section("auth-ui", 1, 50).await?;
        store.create_section("billing", 2, 50).await?;

        let section = store.resolve_section("bil").await?;
        assert_eq!(section.name, "billing");

        let err = store.resolve_section("auth").await.unwrap_err();
        match err {
            Error::AmbiguousSection { matches, .. } => {
                assert_eq!(matches.len(), 2);
            }
            other => panic!("expected AmbiguousSection, got {other:?}"),
        }

        // An exact name wins even when it is also a prefix of another.
        store.create_section("auth", 3, 50).await?;
        let section = store.resolve_section("auth").await?;
        assert_eq!(section.name, "auth");
        Ok(())
    }

    #[tokio::test]
    async fn test_dependencies_met_requires_completed_tasks() -> Result<()> {
        let store = store().await;
        let base = store.create_section("base", 0, 50).await?;
        let top = store.create_section("top", 1, 50).await?;
        store.add_section_dependency(&top.id, &base.id).await?;

        // No tasks in base yet: trivially met.
        assert!(store.dependencies_met(&top.id).await?);

        let task = store
            .create_task("base task", Some(&base.id), None, "h")
            .await?;
        assert!(!store.dependencies_met(&top.id).await?);

        store
            .transition_task(&task.id, crate::types::TaskStatus::InProgress, "c", None, None)
            .await?;
        store
            .transition_task(&task.id, crate::types::TaskStatus::Review, "c", None, None)
            .await?;
        store
            .transition_task(&task.id, crate::types::TaskStatus::Completed, "r", None, None)
            .await?;
        assert!(store.dependencies_met(&top.id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_priority_bounds_enforced() {
        let store = store().await;
        assert!(store.create_section("x", 0, 101).await.is_err());
        assert!(store.create_section("x", 0, -1).await.is_err());
    }
}
