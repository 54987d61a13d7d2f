use shared::{
    domain::{Mission, Profile, ProfileRole},
    protocol::CreateMissionRequest,
};
use storage::Storage;

use crate::{ApiContext, Caller};

pub(crate) struct Fixture {
    pub ctx: ApiContext,
    pub admin: Profile,
    pub employee: Profile,
    pub alice: Profile,
    pub bob: Profile,
}

impl Fixture {
    pub async fn new() -> Self {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let admin = storage
            .create_profile("admin@example.com", "Admin", ProfileRole::Admin)
            .await
            .expect("admin");
        let employee = storage
            .create_profile("tech@example.com", "Tech", ProfileRole::Employee)
            .await
            .expect("employee");
        let alice = storage
            .create_profile("alice@example.com", "Alice", ProfileRole::Subcontractor)
            .await
            .expect("alice");
        let bob = storage
            .create_profile("bob@example.com", "Bob", ProfileRole::Subcontractor)
            .await
            .expect("bob");
        Self {
            ctx: ApiContext::new(storage),
            admin,
            employee,
            alice,
            bob,
        }
    }

    pub async fn mission(&self, reference: &str) -> Mission {
        crate::create_mission(
            &self.ctx,
            caller(&self.admin),
            CreateMissionRequest {
                reference: reference.into(),
                title: "Heat pump maintenance".into(),
                customer_name: Some("Dupont".into()),
                ..CreateMissionRequest::default()
            },
        )
        .await
        .expect("create mission")
        .value
    }
}

pub(crate) fn caller(profile: &Profile) -> Caller {
    Caller {
        user_id: profile.id,
        role: profile.role,
    }
}
