use rusqlite::{Connection, OptionalExtension};

/// Error surfaced by actor resolution, neutral so each handler family can
/// wrap it in its own response style.
#[derive(Debug)]
pub struct ActorErr {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: String,
    pub last_name: String,
    pub first_name: String,
    pub class_id: Option<String>,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == "ADMIN"
    }

    pub fn is_teacher(&self) -> bool {
        self.role == "PROF"
    }

    pub fn is_student(&self) -> bool {
        self.role == "ELEVE"
    }
}

/// Resolve the acting user from `params.actorId`. Transport-level
/// authentication happens upstream of the daemon; here we only re-read the
/// actor's role and account state from the workspace.
pub fn load_actor(conn: &Connection, params: &serde_json::Value) -> Result<Actor, ActorErr> {
    let Some(actor_id) = params.get("actorId").and_then(|v| v.as_str()) else {
        return Err(ActorErr {
            code: "unauthorized",
            message: "missing actorId".to_string(),
        });
    };
    let row = conn
        .query_row(
            "SELECT id, role, last_name, first_name, class_id, active
             FROM users WHERE id = ?",
            [actor_id],
            |r| {
                Ok((
                    Actor {
                        id: r.get(0)?,
                        role: r.get(1)?,
                        last_name: r.get(2)?,
                        first_name: r.get(3)?,
                        class_id: r.get(4)?,
                    },
                    r.get::<_, i64>(5)? != 0,
                ))
            },
        )
        .optional()
        .map_err(|e| ActorErr {
            code: "db_query_failed",
            message: e.to_string(),
        })?;
    let Some((actor, active)) = row else {
        return Err(ActorErr {
            code: "unauthorized",
            message: "unknown actor".to_string(),
        });
    };
    if !active {
        return Err(ActorErr {
            code: "forbidden",
            message: "this account is disabled, contact the administration".to_string(),
        });
    }
    Ok(actor)
}

pub fn require_role(actor: &Actor, roles: &[&str]) -> Result<(), ActorErr> {
    if roles.contains(&actor.role.as_str()) {
        return Ok(());
    }
    Err(ActorErr {
        code: "forbidden",
        message: "access denied for this role".to_string(),
    })
}
