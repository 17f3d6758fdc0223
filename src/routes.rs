use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;
use crate::reminder::ReminderService;
use crate::schema_ops::{ensure_category_in_schema, SchemaService};
use crate::store;

#[derive(Clone)]
pub struct AppState {
    pub schemas: SchemaService,
    pub reminders: ReminderService,
}

pub fn router(state: AppState) -> Router {
    let phase = Router::new()
        .route("/schema", get(get_schema))
        .route("/category", post(create_category))
        .route(
            "/category/:category_id",
            put(update_category).delete(delete_category),
        )
        .route("/competency", post(create_competency))
        .route(
            "/competency/:competency_id",
            put(update_competency).delete(delete_competency),
        )
        .route("/config", get(get_config).put(update_config))
        .route("/config/deadline", put(update_deadline))
        .route(
            "/config/evaluation-reminder/:evaluation_type",
            get(reminder_recipients).post(send_reminder),
        )
        .route("/evaluation/completed", put(upsert_completion))
        .route(
            "/evaluation/completed/:author_id/:target_id/:evaluation_type",
            get(get_completion),
        );

    Router::new()
        .nest("/assessment/api/course_phase/:course_phase_id", phase)
        .with_state(state)
}

// --- schema read ---

async fn get_schema(
    State(state): State<AppState>,
    Path(course_phase_id): Path<Uuid>,
) -> Result<Json<SchemaWithCategories>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;
    let db = state.schemas.db();
    let schema = store::get_schema(db, config.assessment_schema_id).await?;

    let mut categories = Vec::new();
    for category in store::list_categories(db, schema.id).await? {
        let competencies = store::list_competencies(db, category.id).await?;
        categories.push(CategoryWithCompetencies {
            category,
            competencies,
        });
    }

    Ok(Json(SchemaWithCategories { schema, categories }))
}

// --- category mutations (all go through the copy engine first) ---

async fn create_category(
    State(state): State<AppState>,
    Path(course_phase_id): Path<Uuid>,
    Json(req): Json<CreateCategoryReq>,
) -> Result<Json<Category>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;
    let target = state
        .schemas
        .prepare_schema_for_modification(config.assessment_schema_id, None, course_phase_id)
        .await?;

    let category = Category {
        id: Uuid::new_v4(),
        assessment_schema_id: target.target_schema_id,
        name: req.name,
        short_name: req.short_name,
        description: req.description,
        weight: req.weight,
    };
    let db = state.schemas.db();
    store::insert_category(db, &category).await?;
    store::touch_schema(db, target.target_schema_id).await?;
    Ok(Json(category))
}

async fn update_category(
    State(state): State<AppState>,
    Path((course_phase_id, category_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateCategoryReq>,
) -> Result<Json<Category>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;
    let db = state.schemas.db();
    let existing = store::get_category(db, category_id).await?;
    ensure_category_in_schema(&existing, config.assessment_schema_id)?;

    let target = state
        .schemas
        .prepare_schema_for_modification(
            config.assessment_schema_id,
            Some(category_id),
            course_phase_id,
        )
        .await?;
    let target_id = target.target_entity_id.ok_or(Error::EntityNotInCopiedSchema)?;

    let mut category = store::get_category(db, target_id).await?;
    if let Some(name) = req.name {
        category.name = name;
    }
    if let Some(short_name) = req.short_name {
        category.short_name = short_name;
    }
    if let Some(description) = req.description {
        category.description = description;
    }
    if let Some(weight) = req.weight {
        category.weight = weight;
    }
    store::update_category(db, &category).await?;
    store::touch_schema(db, target.target_schema_id).await?;
    Ok(Json(category))
}

async fn delete_category(
    State(state): State<AppState>,
    Path((course_phase_id, category_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;
    let db = state.schemas.db();
    let existing = store::get_category(db, category_id).await?;
    ensure_category_in_schema(&existing, config.assessment_schema_id)?;

    let target = state
        .schemas
        .prepare_schema_for_modification(
            config.assessment_schema_id,
            Some(category_id),
            course_phase_id,
        )
        .await?;
    let target_id = target.target_entity_id.ok_or(Error::EntityNotInCopiedSchema)?;

    store::delete_category(db, target_id).await?;
    store::touch_schema(db, target.target_schema_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- competency mutations ---

async fn create_competency(
    State(state): State<AppState>,
    Path(course_phase_id): Path<Uuid>,
    Json(req): Json<CreateCompetencyReq>,
) -> Result<Json<Competency>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;
    let db = state.schemas.db();
    let parent = store::get_category(db, req.category_id).await?;
    ensure_category_in_schema(&parent, config.assessment_schema_id)?;

    let target = state
        .schemas
        .prepare_schema_for_modification(
            config.assessment_schema_id,
            // the parent category must exist in the schema the edit lands in
            Some(req.category_id),
            course_phase_id,
        )
        .await?;
    let category_id = target.target_entity_id.ok_or(Error::EntityNotInCopiedSchema)?;

    let competency = Competency {
        id: Uuid::new_v4(),
        category_id,
        name: req.name,
        description: req.description,
        description_novice: req.description_novice,
        description_intermediate: req.description_intermediate,
        description_advanced: req.description_advanced,
        description_expert: req.description_expert,
        weight: req.weight,
    };
    store::insert_competency(db, &competency).await?;
    store::touch_schema(db, target.target_schema_id).await?;
    Ok(Json(competency))
}

async fn update_competency(
    State(state): State<AppState>,
    Path((course_phase_id, competency_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateCompetencyReq>,
) -> Result<Json<Competency>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;
    let db = state.schemas.db();
    let existing = store::get_competency(db, competency_id).await?;
    let parent = store::get_category(db, existing.category_id).await?;
    ensure_category_in_schema(&parent, config.assessment_schema_id)?;

    let target = state
        .schemas
        .prepare_schema_for_modification(
            config.assessment_schema_id,
            Some(competency_id),
            course_phase_id,
        )
        .await?;
    let target_id = target.target_entity_id.ok_or(Error::EntityNotInCopiedSchema)?;

    let mut competency = store::get_competency(db, target_id).await?;
    if let Some(name) = req.name {
        competency.name = name;
    }
    if let Some(description) = req.description {
        competency.description = description;
    }
    if let Some(novice) = req.description_novice {
        competency.description_novice = novice;
    }
    if let Some(intermediate) = req.description_intermediate {
        competency.description_intermediate = intermediate;
    }
    if let Some(advanced) = req.description_advanced {
        competency.description_advanced = advanced;
    }
    if let Some(expert) = req.description_expert {
        competency.description_expert = expert;
    }
    if let Some(weight) = req.weight {
        competency.weight = weight;
    }
    store::update_competency(db, &competency).await?;
    store::touch_schema(db, target.target_schema_id).await?;
    Ok(Json(competency))
}

async fn delete_competency(
    State(state): State<AppState>,
    Path((course_phase_id, competency_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;
    let db = state.schemas.db();
    let existing = store::get_competency(db, competency_id).await?;
    let parent = store::get_category(db, existing.category_id).await?;
    ensure_category_in_schema(&parent, config.assessment_schema_id)?;

    let target = state
        .schemas
        .prepare_schema_for_modification(
            config.assessment_schema_id,
            Some(competency_id),
            course_phase_id,
        )
        .await?;
    let target_id = target.target_entity_id.ok_or(Error::EntityNotInCopiedSchema)?;

    store::delete_competency(db, target_id).await?;
    store::touch_schema(db, target.target_schema_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- config ---

async fn get_config(
    State(state): State<AppState>,
    Path(course_phase_id): Path<Uuid>,
) -> Result<Json<CoursePhaseConfig>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;
    Ok(Json(config))
}

async fn update_config(
    State(state): State<AppState>,
    Path(course_phase_id): Path<Uuid>,
    Json(req): Json<UpdateConfigReq>,
) -> Result<Json<CoursePhaseConfig>> {
    let mut config = state.schemas.get_or_init_config(course_phase_id).await?;
    config.apply_update(req);
    store::update_config(state.schemas.db(), &config).await?;
    Ok(Json(config))
}

async fn update_deadline(
    State(state): State<AppState>,
    Path(course_phase_id): Path<Uuid>,
    Json(req): Json<UpdateDeadlineReq>,
) -> Result<Json<serde_json::Value>> {
    state.schemas.get_or_init_config(course_phase_id).await?;
    store::update_config_deadline(state.schemas.db(), course_phase_id, req.deadline).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- evaluation completions ---

async fn get_completion(
    State(state): State<AppState>,
    Path((course_phase_id, author_id, target_id, ev_type)): Path<(
        Uuid,
        Uuid,
        Uuid,
        EvaluationType,
    )>,
) -> Result<Json<EvaluationCompletion>> {
    let found =
        store::get_completion(state.schemas.db(), course_phase_id, author_id, target_id, ev_type)
            .await?;
    // no row means "not yet completed", not an error
    let completion = found.unwrap_or(EvaluationCompletion {
        id: Uuid::nil(),
        course_participation_id: target_id,
        course_phase_id,
        author_course_participation_id: author_id,
        completed_at: None,
        completed: false,
        evaluation_type: ev_type,
    });
    Ok(Json(completion))
}

async fn upsert_completion(
    State(state): State<AppState>,
    Path(course_phase_id): Path<Uuid>,
    Json(req): Json<UpsertCompletionReq>,
) -> Result<Json<EvaluationCompletion>> {
    let config = state.schemas.get_or_init_config(course_phase_id).await?;

    // unmarking after the deadline is forbidden for students
    if !req.completed {
        let deadline = config.evaluation_deadline(req.evaluation_type);
        if matches!(deadline, Some(d) if Utc::now() > d) {
            return Err(Error::DeadlinePassed);
        }
    }

    let completion = EvaluationCompletion {
        id: Uuid::new_v4(),
        course_participation_id: req.course_participation_id,
        course_phase_id,
        author_course_participation_id: req.author_course_participation_id,
        completed_at: req.completed.then(Utc::now),
        completed: req.completed,
        evaluation_type: req.evaluation_type,
    };
    store::upsert_completion(state.schemas.db(), &completion).await?;
    Ok(Json(completion))
}

// --- reminders ---

async fn reminder_recipients(
    State(state): State<AppState>,
    Path((course_phase_id, ev_type)): Path<(Uuid, EvaluationType)>,
) -> Result<Json<ReminderRecipients>> {
    let recipients = state
        .reminders
        .get_evaluation_reminder_recipients(course_phase_id, ev_type)
        .await?;
    Ok(Json(recipients))
}

async fn send_reminder(
    State(state): State<AppState>,
    Path((course_phase_id, ev_type)): Path<(Uuid, EvaluationType)>,
) -> Result<Json<ReminderReport>> {
    let report = state
        .reminders
        .send_evaluation_reminder(course_phase_id, ev_type)
        .await?;
    Ok(Json(report))
}
