use journalkeeper_raft::RaftConfig;
use serde_derive::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeeperConfig {
    pub raft: RaftConfig,
}

pub fn config<P: AsRef<std::path::Path>>(config_path: P) -> KeeperConfig {
    let mut settings = config::Config::default();
    settings
        .merge(config::File::from(config_path.as_ref()))
        .expect("Could not read configuration file")
        .merge(config::Environment::with_prefix("JOURNALKEEPER"))
        .expect("Could not read environment variables");

    settings.try_into().expect("Could not create configuration")
}
