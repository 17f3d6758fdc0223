//! Assessment-schema copy-on-write. A schema shared between course phases is
//! never edited in a way that would silently change grading criteria for a
//! phase that already recorded assessment data; instead the affected phase is
//! given its own copy and its recorded rows are repointed to the copy's
//! entities before the edit lands.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core_client::CoreClient;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{AssessmentSchema, Category, Competency, CoursePhaseConfig};
use crate::store;

/// How the editing phase relates to the schema it is about to modify.
/// Resolved once per operation and threaded through explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaRelationship {
    Owner,
    Consumer,
}

/// What `prepare_schema_for_modification` decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationPlan {
    /// Unshared schema, or shared but the edit cannot leak: mutate in place.
    InPlace,
    /// Owner edits while other phases consume the schema: fork a copy per
    /// consumer, keep editing the original.
    ForkConsumers,
    /// A consumer edits a schema still shared with others: fork one copy for
    /// the editor and redirect the edit into it.
    ForkEditor,
}

pub fn decide_modification(
    relationship: SchemaRelationship,
    has_other_consumers: bool,
) -> ModificationPlan {
    match (relationship, has_other_consumers) {
        (_, false) => ModificationPlan::InPlace,
        (SchemaRelationship::Owner, true) => ModificationPlan::ForkConsumers,
        (SchemaRelationship::Consumer, true) => ModificationPlan::ForkEditor,
    }
}

/// Where a schema modification should actually be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModificationTarget {
    pub target_schema_id: Uuid,
    /// Counterpart of the entity the caller asked to modify; `None` when the
    /// operation creates a new entity. Equals the input when no copy happened.
    pub target_entity_id: Option<Uuid>,
    pub needs_copy: bool,
}

/// Rejects edits that name an entity outside the phase's configured schema;
/// without this, an in-place edit could mutate another phase's grading
/// criteria directly. Competency edits check the parent category.
pub fn ensure_category_in_schema(category: &Category, schema_id: Uuid) -> Result<()> {
    if category.assessment_schema_id == schema_id {
        Ok(())
    } else {
        Err(Error::EntityNotFound("category"))
    }
}

/// A fully materialized copy of a schema: fresh IDs throughout, content
/// preserved, plus the old-to-new correspondence maps used for remapping.
#[derive(Debug, Clone)]
pub struct SchemaCopyPlan {
    pub schema: AssessmentSchema,
    pub categories: Vec<Category>,
    pub competencies: Vec<Competency>,
    pub category_map: HashMap<Uuid, Uuid>,
    pub competency_map: HashMap<Uuid, Uuid>,
}

impl SchemaCopyPlan {
    /// Finds the copied counterpart of an entity, tried first as a
    /// competency, then as a category.
    pub fn corresponding_entity(&self, entity_id: Uuid) -> Result<Uuid> {
        self.competency_map
            .get(&entity_id)
            .or_else(|| self.category_map.get(&entity_id))
            .copied()
            .ok_or(Error::EntityNotInCopiedSchema)
    }
}

/// Clones a schema's entity tree with fresh IDs. Correspondence is
/// structural: each source category/competency maps to the copy made from it,
/// so names, descriptions and weights carry over unchanged.
pub fn plan_schema_copy(
    source: &AssessmentSchema,
    categories: &[Category],
    competencies: &[Competency],
    new_name: String,
    owner_course_phase_id: Uuid,
    now: DateTime<Utc>,
) -> SchemaCopyPlan {
    let schema = AssessmentSchema {
        id: Uuid::new_v4(),
        name: new_name,
        description: source.description.clone(),
        owner_course_phase_id,
        created_at: now,
        updated_at: now,
    };

    let mut category_map = HashMap::with_capacity(categories.len());
    let mut new_categories = Vec::with_capacity(categories.len());
    for category in categories {
        let copy = Category {
            id: Uuid::new_v4(),
            assessment_schema_id: schema.id,
            ..category.clone()
        };
        category_map.insert(category.id, copy.id);
        new_categories.push(copy);
    }

    let mut competency_map = HashMap::with_capacity(competencies.len());
    let mut new_competencies = Vec::with_capacity(competencies.len());
    for competency in competencies {
        // Skips competencies whose category is not part of the source schema;
        // list_competencies_for_schema never returns such rows.
        let Some(&new_category_id) = category_map.get(&competency.category_id) else {
            continue;
        };
        let copy = Competency {
            id: Uuid::new_v4(),
            category_id: new_category_id,
            ..competency.clone()
        };
        competency_map.insert(competency.id, copy.id);
        new_competencies.push(copy);
    }

    SchemaCopyPlan {
        schema,
        categories: new_categories,
        competencies: new_competencies,
        category_map,
        competency_map,
    }
}

/// Service wrapper around the copy engine; holds its own database handle and
/// core-service client (constructor injection, no global state).
#[derive(Clone)]
pub struct SchemaService {
    db: Db,
    core: CoreClient,
}

impl SchemaService {
    pub fn new(db: Db, core: CoreClient) -> Self {
        Self { db, core }
    }

    pub async fn resolve_relationship(
        &self,
        schema_id: Uuid,
        course_phase_id: Uuid,
    ) -> Result<SchemaRelationship> {
        let is_owner = store::check_schema_ownership(&self.db, schema_id, course_phase_id).await?;
        Ok(if is_owner {
            SchemaRelationship::Owner
        } else {
            SchemaRelationship::Consumer
        })
    }

    /// Decides whether a modification to `entity_id` under `schema_id`,
    /// initiated by `course_phase_id`, can happen in place or requires
    /// forking, and performs the fork. Returns where the edit should land.
    ///
    /// Callers must invoke this exactly once per logical edit: the copies are
    /// not deduplicated, so a second call forks again.
    pub async fn prepare_schema_for_modification(
        &self,
        schema_id: Uuid,
        entity_id: Option<Uuid>,
        course_phase_id: Uuid,
    ) -> Result<ModificationTarget> {
        let relationship = self.resolve_relationship(schema_id, course_phase_id).await?;
        let consumers = store::get_consumer_phases(&self.db, schema_id, course_phase_id).await?;

        match decide_modification(relationship, !consumers.is_empty()) {
            ModificationPlan::InPlace => Ok(ModificationTarget {
                target_schema_id: schema_id,
                target_entity_id: entity_id,
                needs_copy: false,
            }),
            ModificationPlan::ForkConsumers => {
                // One copy per consumer, in order; a failure partway leaves
                // earlier consumers forked and later ones untouched.
                for consumer_phase in consumers {
                    let has_data = store::check_phase_has_assessment_data(
                        &self.db,
                        consumer_phase,
                        schema_id,
                    )
                    .await?;
                    let plan = self.copy_schema_for_phase(schema_id, consumer_phase).await?;
                    store::update_config_assessment_schema(
                        &self.db,
                        consumer_phase,
                        plan.schema.id,
                    )
                    .await?;
                    if has_data {
                        self.remap_recorded_references(consumer_phase, &plan).await?;
                    }
                    tracing::info!(
                        schema = %schema_id,
                        copy = %plan.schema.id,
                        phase = %consumer_phase,
                        remapped = has_data,
                        "forked schema for consumer phase"
                    );
                }
                // The owner keeps editing the original.
                Ok(ModificationTarget {
                    target_schema_id: schema_id,
                    target_entity_id: entity_id,
                    needs_copy: true,
                })
            }
            ModificationPlan::ForkEditor => {
                let plan = self.copy_schema_for_phase(schema_id, course_phase_id).await?;
                store::update_config_assessment_schema(&self.db, course_phase_id, plan.schema.id)
                    .await?;
                let target_entity_id = match entity_id {
                    Some(id) => Some(plan.corresponding_entity(id)?),
                    None => None,
                };
                tracing::info!(
                    schema = %schema_id,
                    copy = %plan.schema.id,
                    phase = %course_phase_id,
                    "forked schema for editing consumer phase"
                );
                Ok(ModificationTarget {
                    target_schema_id: plan.schema.id,
                    target_entity_id,
                    needs_copy: true,
                })
            }
        }
    }

    /// Copies a schema, attributed to `for_phase_id`, in one transaction.
    /// The caller repoints the phase's config only after this commits; a
    /// repoint failure leaves the committed copy orphaned (not cleaned up).
    pub async fn copy_schema_for_phase(
        &self,
        schema_id: Uuid,
        for_phase_id: Uuid,
    ) -> Result<SchemaCopyPlan> {
        let source = store::get_schema(&self.db, schema_id).await?;
        let categories = store::list_categories(&self.db, schema_id).await?;
        let competencies = store::list_competencies_for_schema(&self.db, schema_id).await?;
        let name = self.copied_schema_name(&source, for_phase_id).await?;

        let plan = plan_schema_copy(
            &source,
            &categories,
            &competencies,
            name,
            for_phase_id,
            Utc::now(),
        );

        let mut tx = self.db.begin().await?;
        store::insert_schema(&mut *tx, &plan.schema).await?;
        for category in &plan.categories {
            store::insert_category(&mut *tx, category).await?;
        }
        for competency in &plan.competencies {
            store::insert_competency(&mut *tx, competency).await?;
        }
        tx.commit().await?;
        Ok(plan)
    }

    /// Human-readable name for a copy, from the consuming phase's course.
    async fn copied_schema_name(
        &self,
        source: &AssessmentSchema,
        for_phase_id: Uuid,
    ) -> Result<String> {
        let phase = self.core.get_course_phase(for_phase_id).await?;
        match phase.course_id {
            Some(course_id) => {
                let course = self.core.get_course(course_id).await?;
                Ok(format!(
                    "{} ({} {})",
                    source.name, course.name, course.semester_tag
                ))
            }
            None => Ok(format!("{} ({})", source.name, phase.name)),
        }
    }

    async fn remap_recorded_references(
        &self,
        course_phase_id: Uuid,
        plan: &SchemaCopyPlan,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for (&old_id, &new_id) in &plan.competency_map {
            store::remap_competency_references(&mut tx, course_phase_id, old_id, new_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fetches a phase's schema with nested categories and competencies,
    /// creating a default schema and config the first time a phase is seen.
    pub async fn get_or_init_config(&self, course_phase_id: Uuid) -> Result<CoursePhaseConfig> {
        if let Some(config) = store::get_config(&self.db, course_phase_id).await? {
            return Ok(config);
        }

        let now = Utc::now();
        let schema = AssessmentSchema {
            id: Uuid::new_v4(),
            name: "Assessment Schema".to_string(),
            description: String::new(),
            owner_course_phase_id: course_phase_id,
            created_at: now,
            updated_at: now,
        };
        let config = CoursePhaseConfig {
            course_phase_id,
            assessment_schema_id: schema.id,
            deadline: None,
            self_evaluation_enabled: false,
            self_evaluation_start: None,
            self_evaluation_deadline: None,
            peer_evaluation_enabled: false,
            peer_evaluation_start: None,
            peer_evaluation_deadline: None,
            tutor_evaluation_enabled: false,
            tutor_evaluation_start: None,
            tutor_evaluation_deadline: None,
            evaluation_results_visible: false,
        };

        let mut tx = self.db.begin().await?;
        store::insert_schema(&mut *tx, &schema).await?;
        let inserted = store::insert_config_if_absent(&mut *tx, &config).await?;
        if !inserted {
            // lost a concurrent first touch; drop our schema and use theirs
            tx.rollback().await?;
            return store::get_config(&self.db, course_phase_id)
                .await?
                .ok_or(Error::ConfigNotFound);
        }
        tx.commit().await?;
        tracing::info!(phase = %course_phase_id, schema = %schema.id, "initialized default assessment schema");
        Ok(config)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(owner: Uuid) -> AssessmentSchema {
        let now = Utc::now();
        AssessmentSchema {
            id: Uuid::new_v4(),
            name: "Intro Project Schema".into(),
            description: "scoring for the intro project".into(),
            owner_course_phase_id: owner,
            created_at: now,
            updated_at: now,
        }
    }

    fn category(schema_id: Uuid, name: &str, weight: i32) -> Category {
        Category {
            id: Uuid::new_v4(),
            assessment_schema_id: schema_id,
            name: name.into(),
            short_name: name.chars().take(3).collect(),
            description: format!("{name} description"),
            weight,
        }
    }

    fn competency(category_id: Uuid, name: &str, weight: i32) -> Competency {
        Competency {
            id: Uuid::new_v4(),
            category_id,
            name: name.into(),
            description: format!("{name} description"),
            description_novice: "novice".into(),
            description_intermediate: "intermediate".into(),
            description_advanced: "advanced".into(),
            description_expert: "expert".into(),
            weight,
        }
    }

    #[test]
    fn unshared_schema_is_modified_in_place_for_any_editor() {
        for rel in [SchemaRelationship::Owner, SchemaRelationship::Consumer] {
            assert_eq!(decide_modification(rel, false), ModificationPlan::InPlace);
        }
    }

    #[test]
    fn shared_schema_forks_consumers_for_owner_and_editor_for_consumer() {
        assert_eq!(
            decide_modification(SchemaRelationship::Owner, true),
            ModificationPlan::ForkConsumers
        );
        assert_eq!(
            decide_modification(SchemaRelationship::Consumer, true),
            ModificationPlan::ForkEditor
        );
    }

    #[test]
    fn edits_naming_an_entity_from_another_schema_are_rejected() {
        let own_schema = schema(Uuid::new_v4());
        let other_schema = schema(Uuid::new_v4());
        let own_category = category(own_schema.id, "Test Category 1", 1);
        let foreign_category = category(other_schema.id, "Test Category 2", 1);

        assert!(ensure_category_in_schema(&own_category, own_schema.id).is_ok());
        // an in-place edit must never reach another phase's schema
        assert!(matches!(
            ensure_category_in_schema(&foreign_category, own_schema.id),
            Err(Error::EntityNotFound("category"))
        ));
    }

    #[test]
    fn competency_parent_check_catches_foreign_competencies() {
        let own_schema = schema(Uuid::new_v4());
        let other_schema = schema(Uuid::new_v4());
        let foreign_parent = category(other_schema.id, "Foreign", 1);
        let foreign_competency = competency(foreign_parent.id, "Code Quality", 1);

        // competency edits validate through the parent category
        assert_eq!(foreign_competency.category_id, foreign_parent.id);
        assert!(ensure_category_in_schema(&foreign_parent, own_schema.id).is_err());
    }

    #[test]
    fn copy_preserves_content_and_structure() {
        let owner = Uuid::new_v4();
        let src = schema(owner);
        let cat_a = category(src.id, "Test Category 1", 2);
        let cat_b = category(src.id, "Test Category 2", 1);
        let comps = vec![
            competency(cat_a.id, "Code Quality", 3),
            competency(cat_a.id, "Testing", 1),
            competency(cat_b.id, "Presentation", 2),
        ];
        let new_owner = Uuid::new_v4();

        let plan = plan_schema_copy(
            &src,
            &[cat_a.clone(), cat_b.clone()],
            &comps,
            "Intro Project Schema (iPraktikum WS24)".into(),
            new_owner,
            Utc::now(),
        );

        assert_ne!(plan.schema.id, src.id);
        assert_eq!(plan.schema.owner_course_phase_id, new_owner);
        assert_eq!(plan.categories.len(), 2);
        assert_eq!(plan.competencies.len(), 3);

        for original in [&cat_a, &cat_b] {
            let copied_id = plan.category_map[&original.id];
            let copied = plan.categories.iter().find(|c| c.id == copied_id).unwrap();
            assert_eq!(copied.name, original.name);
            assert_eq!(copied.description, original.description);
            assert_eq!(copied.weight, original.weight);
            assert_eq!(copied.assessment_schema_id, plan.schema.id);
        }
        for original in &comps {
            let copied_id = plan.competency_map[&original.id];
            let copied = plan
                .competencies
                .iter()
                .find(|c| c.id == copied_id)
                .unwrap();
            assert_eq!(copied.name, original.name);
            assert_eq!(copied.weight, original.weight);
            assert_eq!(copied.description_expert, original.description_expert);
            // the competency lands under the copied counterpart of its category
            assert_eq!(copied.category_id, plan.category_map[&original.category_id]);
        }
    }

    #[test]
    fn copy_uses_fresh_ids_disjoint_from_source() {
        let src = schema(Uuid::new_v4());
        let cat = category(src.id, "Test Category 1", 1);
        let comp = competency(cat.id, "Code Quality", 1);
        let plan = plan_schema_copy(
            &src,
            std::slice::from_ref(&cat),
            std::slice::from_ref(&comp),
            "copy".into(),
            Uuid::new_v4(),
            Utc::now(),
        );

        assert_ne!(plan.category_map[&cat.id], cat.id);
        assert_ne!(plan.competency_map[&comp.id], comp.id);
        // every source entity has exactly one counterpart
        assert_eq!(plan.category_map.len(), 1);
        assert_eq!(plan.competency_map.len(), 1);
    }

    #[test]
    fn corresponding_entity_tries_competency_then_category() {
        let src = schema(Uuid::new_v4());
        let cat = category(src.id, "Test Category 1", 1);
        let comp = competency(cat.id, "Code Quality", 1);
        let plan = plan_schema_copy(
            &src,
            std::slice::from_ref(&cat),
            std::slice::from_ref(&comp),
            "copy".into(),
            Uuid::new_v4(),
            Utc::now(),
        );

        assert_eq!(
            plan.corresponding_entity(comp.id).unwrap(),
            plan.competency_map[&comp.id]
        );
        assert_eq!(
            plan.corresponding_entity(cat.id).unwrap(),
            plan.category_map[&cat.id]
        );
        let unknown = Uuid::new_v4();
        assert!(matches!(
            plan.corresponding_entity(unknown),
            Err(Error::EntityNotInCopiedSchema)
        ));
    }

    #[test]
    fn remap_pairs_cover_every_source_competency() {
        let src = schema(Uuid::new_v4());
        let cat_a = category(src.id, "Test Category 1", 1);
        let cat_b = category(src.id, "Test Category 2", 1);
        let comps: Vec<Competency> = (0..5)
            .map(|i| {
                let parent = if i % 2 == 0 { cat_a.id } else { cat_b.id };
                competency(parent, &format!("Competency {i}"), i + 1)
            })
            .collect();
        let plan = plan_schema_copy(
            &src,
            &[cat_a, cat_b],
            &comps,
            "copy".into(),
            Uuid::new_v4(),
            Utc::now(),
        );

        let source_ids: std::collections::HashSet<Uuid> = comps.iter().map(|c| c.id).collect();
        assert_eq!(plan.competency_map.len(), source_ids.len());
        for id in &source_ids {
            let new_id = plan.competency_map[id];
            // the new id resolves only within the copy, never the source
            assert!(!source_ids.contains(&new_id));
            assert!(plan.competencies.iter().any(|c| c.id == new_id));
        }
    }
}
