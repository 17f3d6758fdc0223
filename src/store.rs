//! sqlx query wrappers. All statements are runtime-bound; functions that the
//! copy engine needs inside a transaction take `impl PgExecutor` so they work
//! against both the pool and an open transaction.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;

// --- assessment schemas ---

pub async fn get_schema(ex: impl PgExecutor<'_>, schema_id: Uuid) -> Result<AssessmentSchema> {
    sqlx::query_as::<_, AssessmentSchema>("SELECT * FROM assessment_schemas WHERE id = $1")
        .bind(schema_id)
        .fetch_optional(ex)
        .await?
        .ok_or(Error::SchemaNotFound)
}

pub async fn insert_schema(ex: impl PgExecutor<'_>, schema: &AssessmentSchema) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO assessment_schemas (id, name, description, owner_course_phase_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(schema.id)
    .bind(&schema.name)
    .bind(&schema.description)
    .bind(schema.owner_course_phase_id)
    .bind(schema.created_at)
    .bind(schema.updated_at)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn touch_schema(ex: impl PgExecutor<'_>, schema_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE assessment_schemas SET updated_at = now() WHERE id = $1")
        .bind(schema_id)
        .execute(ex)
        .await?;
    Ok(())
}

// --- ownership / usage queries ---

pub async fn check_schema_ownership(
    ex: impl PgExecutor<'_>,
    schema_id: Uuid,
    course_phase_id: Uuid,
) -> Result<bool> {
    let owned = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM assessment_schemas WHERE id = $1 AND owner_course_phase_id = $2)",
    )
    .bind(schema_id)
    .bind(course_phase_id)
    .fetch_one(ex)
    .await
    .map_err(Error::query("failed to check schema ownership"))?;
    Ok(owned)
}

pub async fn get_consumer_phases(
    ex: impl PgExecutor<'_>,
    schema_id: Uuid,
    excluding_phase_id: Uuid,
) -> Result<Vec<Uuid>> {
    let phases = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT course_phase_id FROM course_phase_configs
        WHERE assessment_schema_id = $1 AND course_phase_id <> $2
        ORDER BY course_phase_id
        "#,
    )
    .bind(schema_id)
    .bind(excluding_phase_id)
    .fetch_all(ex)
    .await
    .map_err(Error::query("failed to check schema usage"))?;
    Ok(phases)
}

pub async fn check_schema_usage_in_other_phases(
    ex: impl PgExecutor<'_>,
    schema_id: Uuid,
    excluding_phase_id: Uuid,
) -> Result<bool> {
    Ok(!get_consumer_phases(ex, schema_id, excluding_phase_id)
        .await?
        .is_empty())
}

/// True iff any recorded assessment or evaluation row for the phase
/// references a competency under the given schema.
pub async fn check_phase_has_assessment_data(
    ex: impl PgExecutor<'_>,
    course_phase_id: Uuid,
    schema_id: Uuid,
) -> Result<bool> {
    let has_data = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM assessments a
            JOIN competencies cp ON cp.id = a.competency_id
            JOIN categories c ON c.id = cp.category_id
            WHERE a.course_phase_id = $1 AND c.assessment_schema_id = $2
        ) OR EXISTS (
            SELECT 1 FROM evaluations e
            JOIN competencies cp ON cp.id = e.competency_id
            JOIN categories c ON c.id = cp.category_id
            WHERE e.course_phase_id = $1 AND c.assessment_schema_id = $2
        )
        "#,
    )
    .bind(course_phase_id)
    .bind(schema_id)
    .fetch_one(ex)
    .await
    .map_err(Error::query("failed to check phase assessment data"))?;
    Ok(has_data)
}

// --- categories ---

pub async fn get_category(ex: impl PgExecutor<'_>, category_id: Uuid) -> Result<Category> {
    sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE id = $1")
        .bind(category_id)
        .fetch_optional(ex)
        .await?
        .ok_or(Error::EntityNotFound("category"))
}

pub async fn list_categories(ex: impl PgExecutor<'_>, schema_id: Uuid) -> Result<Vec<Category>> {
    let categories = sqlx::query_as::<_, Category>(
        "SELECT * FROM categories WHERE assessment_schema_id = $1 ORDER BY name, id",
    )
    .bind(schema_id)
    .fetch_all(ex)
    .await?;
    Ok(categories)
}

pub async fn insert_category(ex: impl PgExecutor<'_>, category: &Category) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO categories (id, assessment_schema_id, name, short_name, description, weight)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(category.id)
    .bind(category.assessment_schema_id)
    .bind(&category.name)
    .bind(&category.short_name)
    .bind(&category.description)
    .bind(category.weight)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn update_category(ex: impl PgExecutor<'_>, category: &Category) -> Result<()> {
    sqlx::query(
        "UPDATE categories SET name = $2, short_name = $3, description = $4, weight = $5 WHERE id = $1",
    )
    .bind(category.id)
    .bind(&category.name)
    .bind(&category.short_name)
    .bind(&category.description)
    .bind(category.weight)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_category(ex: impl PgExecutor<'_>, category_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM categories WHERE id = $1")
        .bind(category_id)
        .execute(ex)
        .await?;
    Ok(())
}

// --- competencies ---

pub async fn get_competency(ex: impl PgExecutor<'_>, competency_id: Uuid) -> Result<Competency> {
    sqlx::query_as::<_, Competency>("SELECT * FROM competencies WHERE id = $1")
        .bind(competency_id)
        .fetch_optional(ex)
        .await?
        .ok_or(Error::EntityNotFound("competency"))
}

pub async fn list_competencies_for_schema(
    ex: impl PgExecutor<'_>,
    schema_id: Uuid,
) -> Result<Vec<Competency>> {
    let competencies = sqlx::query_as::<_, Competency>(
        r#"
        SELECT cp.* FROM competencies cp
        JOIN categories c ON c.id = cp.category_id
        WHERE c.assessment_schema_id = $1
        ORDER BY c.name, cp.name, cp.id
        "#,
    )
    .bind(schema_id)
    .fetch_all(ex)
    .await?;
    Ok(competencies)
}

pub async fn list_competencies(
    ex: impl PgExecutor<'_>,
    category_id: Uuid,
) -> Result<Vec<Competency>> {
    let competencies = sqlx::query_as::<_, Competency>(
        "SELECT * FROM competencies WHERE category_id = $1 ORDER BY name, id",
    )
    .bind(category_id)
    .fetch_all(ex)
    .await?;
    Ok(competencies)
}

pub async fn insert_competency(ex: impl PgExecutor<'_>, competency: &Competency) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO competencies
            (id, category_id, name, description, description_novice, description_intermediate,
             description_advanced, description_expert, weight)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(competency.id)
    .bind(competency.category_id)
    .bind(&competency.name)
    .bind(&competency.description)
    .bind(&competency.description_novice)
    .bind(&competency.description_intermediate)
    .bind(&competency.description_advanced)
    .bind(&competency.description_expert)
    .bind(competency.weight)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn update_competency(ex: impl PgExecutor<'_>, competency: &Competency) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE competencies SET
            name = $2, description = $3, description_novice = $4,
            description_intermediate = $5, description_advanced = $6,
            description_expert = $7, weight = $8
        WHERE id = $1
        "#,
    )
    .bind(competency.id)
    .bind(&competency.name)
    .bind(&competency.description)
    .bind(&competency.description_novice)
    .bind(&competency.description_intermediate)
    .bind(&competency.description_advanced)
    .bind(&competency.description_expert)
    .bind(competency.weight)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_competency(ex: impl PgExecutor<'_>, competency_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM competencies WHERE id = $1")
        .bind(competency_id)
        .execute(ex)
        .await?;
    Ok(())
}

// --- course phase config ---

pub async fn get_config(
    ex: impl PgExecutor<'_>,
    course_phase_id: Uuid,
) -> Result<Option<CoursePhaseConfig>> {
    let config = sqlx::query_as::<_, CoursePhaseConfig>(
        "SELECT * FROM course_phase_configs WHERE course_phase_id = $1",
    )
    .bind(course_phase_id)
    .fetch_optional(ex)
    .await?;
    Ok(config)
}

/// First-touch insert. `ON CONFLICT DO NOTHING` keeps concurrent first
/// touches of the same phase from failing on the primary key; the loser
/// re-reads the winner's row.
pub const INSERT_CONFIG_IF_ABSENT_SQL: &str = r#"
        INSERT INTO course_phase_configs
            (course_phase_id, assessment_schema_id, deadline,
             self_evaluation_enabled, self_evaluation_start, self_evaluation_deadline,
             peer_evaluation_enabled, peer_evaluation_start, peer_evaluation_deadline,
             tutor_evaluation_enabled, tutor_evaluation_start, tutor_evaluation_deadline,
             evaluation_results_visible)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (course_phase_id) DO NOTHING
        "#;

/// Returns whether the row was inserted (false when the phase already has a
/// config).
pub async fn insert_config_if_absent(
    ex: impl PgExecutor<'_>,
    config: &CoursePhaseConfig,
) -> Result<bool> {
    let result = sqlx::query(INSERT_CONFIG_IF_ABSENT_SQL)
    .bind(config.course_phase_id)
    .bind(config.assessment_schema_id)
    .bind(config.deadline)
    .bind(config.self_evaluation_enabled)
    .bind(config.self_evaluation_start)
    .bind(config.self_evaluation_deadline)
    .bind(config.peer_evaluation_enabled)
    .bind(config.peer_evaluation_start)
    .bind(config.peer_evaluation_deadline)
    .bind(config.tutor_evaluation_enabled)
    .bind(config.tutor_evaluation_start)
    .bind(config.tutor_evaluation_deadline)
    .bind(config.evaluation_results_visible)
    .execute(ex)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_config(ex: impl PgExecutor<'_>, config: &CoursePhaseConfig) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE course_phase_configs SET
            self_evaluation_enabled = $2, self_evaluation_start = $3, self_evaluation_deadline = $4,
            peer_evaluation_enabled = $5, peer_evaluation_start = $6, peer_evaluation_deadline = $7,
            tutor_evaluation_enabled = $8, tutor_evaluation_start = $9, tutor_evaluation_deadline = $10,
            evaluation_results_visible = $11
        WHERE course_phase_id = $1
        "#,
    )
    .bind(config.course_phase_id)
    .bind(config.self_evaluation_enabled)
    .bind(config.self_evaluation_start)
    .bind(config.self_evaluation_deadline)
    .bind(config.peer_evaluation_enabled)
    .bind(config.peer_evaluation_start)
    .bind(config.peer_evaluation_deadline)
    .bind(config.tutor_evaluation_enabled)
    .bind(config.tutor_evaluation_start)
    .bind(config.tutor_evaluation_deadline)
    .bind(config.evaluation_results_visible)
    .execute(ex)
    .await?;
    Ok(())
}

/// The single-purpose write the copy engine issues after a successful copy.
pub async fn update_config_assessment_schema(
    ex: impl PgExecutor<'_>,
    course_phase_id: Uuid,
    schema_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "UPDATE course_phase_configs SET assessment_schema_id = $2 WHERE course_phase_id = $1",
    )
    .bind(course_phase_id)
    .bind(schema_id)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn update_config_deadline(
    ex: impl PgExecutor<'_>,
    course_phase_id: Uuid,
    deadline: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE course_phase_configs SET deadline = $2 WHERE course_phase_id = $1")
        .bind(course_phase_id)
        .bind(deadline)
        .execute(ex)
        .await?;
    Ok(())
}

// --- evaluation completions ---

fn completion_from_row(row: PgRow) -> Result<EvaluationCompletion> {
    let ev_type: String = row.try_get("evaluation_type")?;
    Ok(EvaluationCompletion {
        id: row.try_get("id")?,
        course_participation_id: row.try_get("course_participation_id")?,
        course_phase_id: row.try_get("course_phase_id")?,
        author_course_participation_id: row.try_get("author_course_participation_id")?,
        completed_at: row.try_get("completed_at")?,
        completed: row.try_get("completed")?,
        evaluation_type: ev_type.parse()?,
    })
}

pub async fn list_completions_for_phase(
    ex: impl PgExecutor<'_>,
    course_phase_id: Uuid,
) -> Result<Vec<EvaluationCompletion>> {
    let rows = sqlx::query("SELECT * FROM evaluation_completions WHERE course_phase_id = $1")
        .bind(course_phase_id)
        .fetch_all(ex)
        .await?;
    rows.into_iter().map(completion_from_row).collect()
}

pub async fn get_completion(
    ex: impl PgExecutor<'_>,
    course_phase_id: Uuid,
    author_course_participation_id: Uuid,
    course_participation_id: Uuid,
    ev_type: EvaluationType,
) -> Result<Option<EvaluationCompletion>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM evaluation_completions
        WHERE course_phase_id = $1 AND author_course_participation_id = $2
          AND course_participation_id = $3 AND evaluation_type = $4
        "#,
    )
    .bind(course_phase_id)
    .bind(author_course_participation_id)
    .bind(course_participation_id)
    .bind(ev_type.as_str())
    .fetch_optional(ex)
    .await?;
    row.map(completion_from_row).transpose()
}

pub async fn upsert_completion(
    ex: impl PgExecutor<'_>,
    completion: &EvaluationCompletion,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO evaluation_completions
            (id, course_participation_id, course_phase_id, author_course_participation_id,
             completed_at, completed, evaluation_type)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (course_phase_id, author_course_participation_id, course_participation_id, evaluation_type)
        DO UPDATE SET completed = EXCLUDED.completed, completed_at = EXCLUDED.completed_at
        "#,
    )
    .bind(completion.id)
    .bind(completion.course_participation_id)
    .bind(completion.course_phase_id)
    .bind(completion.author_course_participation_id)
    .bind(completion.completed_at)
    .bind(completion.completed)
    .bind(completion.evaluation_type.as_str())
    .execute(ex)
    .await?;
    Ok(())
}

// --- recorded reference remapping ---

/// Repoints one phase's recorded assessment and evaluation rows from an old
/// competency to its counterpart in a schema copy.
pub async fn remap_competency_references(
    conn: &mut sqlx::PgConnection,
    course_phase_id: Uuid,
    old_competency_id: Uuid,
    new_competency_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "UPDATE assessments SET competency_id = $3 WHERE course_phase_id = $1 AND competency_id = $2",
    )
    .bind(course_phase_id)
    .bind(old_competency_id)
    .bind(new_competency_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE evaluations SET competency_id = $3 WHERE course_phase_id = $1 AND competency_id = $2",
    )
    .bind(course_phase_id)
    .bind(old_competency_id)
    .bind(new_competency_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_touch_config_insert_tolerates_a_concurrent_winner() {
        assert!(INSERT_CONFIG_IF_ABSENT_SQL.contains("ON CONFLICT (course_phase_id) DO NOTHING"));
    }
}
