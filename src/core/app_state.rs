//! Application state - Coordinates containers, launchers, processes and the store

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::app_type::IsolationMethod;
use super::application::Application;
use super::container::{ContainerBuilder, ContainerValidation};
use super::instance::{same_shim_path, shim_path_for, AppInstance, InstanceId, InstanceOptions};
use super::isolation::{IsolationResolver, LaunchEnvironment, PROFILE_SUBDIR};
use super::process::{LaunchOutcome, ProcessEvent, ProcessTracker};
use super::settings::Settings;
use super::transfer::{parse_import, ExportDocument};
use crate::error::{InstanceError, Result};
use crate::persistence::InstanceStore;
use crate::platform::{ShellIntegration, SystemShell};
use crate::shim::ShimGenerator;

/// How long delete waits for a running instance to quit before killing it
const DELETE_GRACE: Duration = Duration::from_secs(5);

/// Outcome of importing a document
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub created: Vec<AppInstance>,
    /// Instance name and the reason it was skipped
    pub failed: Vec<(String, String)>,
}

/// Central application state. Each service serializes its own work; this
/// type only sequences them.
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<InstanceStore>,
    pub containers: Arc<ContainerBuilder>,
    pub shims: Arc<ShimGenerator>,
    pub tracker: Arc<ProcessTracker>,
    pub resolver: IsolationResolver,
    shell: Arc<dyn ShellIntegration>,
}

impl AppState {
    /// Create a new application state backed by the OS shell
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_shell(settings, Arc::new(SystemShell))
    }

    pub fn with_shell(settings: Settings, shell: Arc<dyn ShellIntegration>) -> Result<Self> {
        let instances_dir = settings.get_instances_directory();
        std::fs::create_dir_all(&instances_dir).map_err(|e| {
            InstanceError::environment("Failed to create directory", &instances_dir, e)
        })?;

        let store = Arc::new(InstanceStore::new(settings.get_store_path()));
        let containers = Arc::new(ContainerBuilder::new(settings.get_real_home()));
        let shims = Arc::new(ShimGenerator::new(
            Arc::clone(&shell),
            settings.bundle_prefix.clone(),
            settings.sign_shims,
            settings.register_shims,
        ));
        let tracker = Arc::new(ProcessTracker::new(
            settings.termination_watch(),
            settings.poll_interval(),
        ));

        info!(
            "Application state initialized (data: {:?}, shims: {:?})",
            settings.get_data_directory(),
            settings.get_shims_directory()
        );

        Ok(Self {
            settings,
            store,
            containers,
            shims,
            tracker,
            resolver: IsolationResolver::default(),
            shell,
        })
    }

    pub fn list(&self) -> Result<Vec<AppInstance>> {
        self.store.load()
    }

    pub fn get(&self, id: InstanceId) -> Result<AppInstance> {
        self.store.get(id)
    }

    /// Look an instance up by full id, id prefix, or exact name
    pub fn find(&self, query: &str) -> Result<AppInstance> {
        let instances = self.store.load()?;
        if let Ok(id) = query.parse::<InstanceId>() {
            if let Some(found) = instances.iter().find(|i| i.id == id) {
                return Ok(found.clone());
            }
        }

        let matches: Vec<&AppInstance> = instances
            .iter()
            .filter(|i| i.name == query || i.id.to_string().starts_with(query))
            .collect();
        match matches.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(InstanceError::NotFound(format!(
                "No instance matches '{}'",
                query
            ))),
            _ => Err(InstanceError::InvalidInput(format!(
                "'{}' matches {} instances; use the id",
                query,
                matches.len()
            ))),
        }
    }

    /// Effective environment and arguments an instance launches with
    pub fn effective_launch(&self, id: InstanceId) -> Result<LaunchEnvironment> {
        Ok(self.resolver.resolve(&self.store.get(id)?))
    }

    /// Shim path for `name`. Bundles already on disk and paths owned by other
    /// instances are avoided, ignoring case as the default macOS volume does.
    fn shim_path(&self, name: &str, id: InstanceId) -> Result<PathBuf> {
        let instances = self.store.load()?;
        let own = instances
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.shim_path.clone());
        Ok(shim_path_for(
            &self.settings.get_shims_directory(),
            name,
            id,
            |path| {
                if own.as_deref().is_some_and(|own| same_shim_path(own, path)) {
                    return false;
                }
                path.exists()
                    || instances
                        .iter()
                        .any(|i| i.id != id && same_shim_path(&i.shim_path, path))
            },
        ))
    }

    fn prepare_container(&self, instance: &AppInstance) -> Result<()> {
        self.containers
            .build(&instance.data_path, instance.target_app_type)?;
        if instance.isolation_method() == IsolationMethod::Profile {
            self.containers
                .ensure_directory(&instance.data_path, PROFILE_SUBDIR)?;
        }
        Ok(())
    }

    fn write_shim(&self, instance: &AppInstance, app: &Application) -> Result<()> {
        if !self.settings.use_shims {
            return Ok(());
        }
        let launch = self.resolver.resolve(instance);
        let report = self.shims.generate(instance, app, &launch)?;
        if report.icon.is_none() {
            warn!("Launcher for '{}' has no icon", instance.name);
        }
        Ok(())
    }

    /// Create an instance of the application at `app_path`. Nothing is stored
    /// unless both the container and the launcher were written.
    pub fn create(
        &self,
        name: &str,
        app_path: &Path,
        options: InstanceOptions,
    ) -> Result<AppInstance> {
        let app = Application::resolve(app_path)?;
        let name = match name.trim() {
            "" => app.name.clone(),
            trimmed => trimmed.to_string(),
        };

        let id = InstanceId::new();
        let shim_path = self.shim_path(&name, id)?;
        let instance = AppInstance::with_id(
            id,
            name,
            &app,
            &self.settings.get_instances_directory(),
            shim_path,
            options,
        );

        info!(
            "Creating instance '{}' of {} ({:?}, {:?})",
            instance.name,
            app.bundle_id,
            app.app_type,
            instance.isolation_method()
        );

        if let Err(e) = self.prepare_container(&instance) {
            self.discard(&instance);
            return Err(e);
        }
        if let Err(e) = self.write_shim(&instance, &app) {
            self.discard(&instance);
            return Err(e);
        }
        if let Err(e) = self.store.add(instance.clone()) {
            self.discard(&instance);
            return Err(e);
        }

        Ok(instance)
    }

    /// Undo the filesystem side effects of a failed create
    fn discard(&self, instance: &AppInstance) {
        if let Err(e) = self.shims.remove(&instance.shim_path) {
            warn!("Failed to clean up launcher {:?}: {}", instance.shim_path, e);
        }
        if let Err(e) = self.containers.remove(&instance.data_path) {
            warn!("Failed to clean up container {:?}: {}", instance.data_path, e);
        }
    }

    /// Launch an instance. A second launch while it runs is a no-op.
    pub async fn launch(&self, id: InstanceId) -> Result<LaunchOutcome> {
        let instance = self.store.get(id)?;
        if let Some(existing) = self.tracker.running(id) {
            debug!("Instance {} is already running", id);
            return Ok(LaunchOutcome::AlreadyRunning(Some(existing)));
        }

        let app = Application::inspect(&instance.target_app_path).map_err(|e| match e {
            InstanceError::NotFound(_) => InstanceError::NotFound(format!(
                "Target application {} is missing",
                instance.target_app_path.display()
            )),
            other => other,
        })?;
        if app.bundle_id != instance.target_bundle_id {
            warn!(
                "Target at {:?} is now {} (was {})",
                instance.target_app_path, app.bundle_id, instance.target_bundle_id
            );
        }

        if !self.containers.validate(&instance.data_path).is_valid() {
            info!("Repairing container for instance {}", id);
            self.containers
                .repair(&instance.data_path, instance.target_app_type)?;
        }
        self.prepare_container(&instance)?;

        let (command, pid_file) = if self.settings.use_shims {
            if !self.shims.exists(&instance) {
                self.write_shim(&instance, &app)?;
            }
            let script = ShimGenerator::executable_path(&instance.shim_path, &instance.name);
            (
                self.shell.open_command(&instance.shim_path, &script),
                Some(ShimGenerator::pid_file(&instance)),
            )
        } else {
            let launch = self.resolver.resolve(&instance);
            let mut command = Command::new(&app.executable_path);
            command
                .args(&launch.arguments)
                .envs(&launch.environment)
                .current_dir(&instance.data_path);
            (command, None)
        };

        let outcome = self.tracker.launch(id, command, pid_file.as_deref()).await?;
        if matches!(outcome, LaunchOutcome::Started(_)) {
            if let Err(e) = self.store.modify(id, AppInstance::mark_launched) {
                warn!("Failed to record launch time for {}: {}", id, e);
            }
        }
        Ok(outcome)
    }

    /// Launch without staying around to watch the process. Erasing data on quit
    /// needs an observer, so such instances are refused.
    pub async fn launch_detached(&self, id: InstanceId) -> Result<LaunchOutcome> {
        let instance = self.store.get(id)?;
        if instance.erase_data_on_quit {
            return Err(InstanceError::InvalidInput(format!(
                "'{}' erases its data on quit and must be launched attached",
                instance.name
            )));
        }
        self.launch(id).await
    }

    pub fn terminate(&self, id: InstanceId) -> bool {
        self.tracker.terminate(id)
    }

    pub fn force_terminate(&self, id: InstanceId) -> bool {
        self.tracker.force_terminate(id)
    }

    /// Rename an instance. The launcher moves; id and data stay put.
    pub fn rename(&self, id: InstanceId, new_name: &str) -> Result<AppInstance> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(InstanceError::InvalidInput(
                "Instance name cannot be empty".to_string(),
            ));
        }

        let old = self.store.get(id)?;
        let mut renamed = old.clone();
        renamed.name = new_name.to_string();
        renamed.shim_path = self.shim_path(new_name, id)?;
        if same_shim_path(&renamed.shim_path, &old.shim_path) {
            // Same bundle on a case-insensitive volume; regenerate in place
            renamed.shim_path = old.shim_path.clone();
        }
        renamed.touch();
        let moved = renamed.shim_path != old.shim_path;

        let app = self.shim_target(&renamed);
        if let Some(app) = &app {
            if let Err(e) = self.write_shim(&renamed, app) {
                self.rollback_shim(&old, &renamed, app);
                return Err(e);
            }
        }

        if let Err(e) = self.store.update(renamed.clone()) {
            if let Some(app) = &app {
                self.rollback_shim(&old, &renamed, app);
            }
            return Err(e);
        }

        if moved {
            if let Err(e) = self.shims.remove(&old.shim_path) {
                warn!("Failed to remove old launcher {:?}: {}", old.shim_path, e);
            }
        }
        info!("Renamed instance {} to '{}'", id, renamed.name);
        Ok(renamed)
    }

    /// Application to write a launcher for, when launchers are in use
    fn shim_target(&self, instance: &AppInstance) -> Option<Application> {
        if !self.settings.use_shims {
            return None;
        }
        match Application::inspect(&instance.target_app_path) {
            Ok(app) => Some(app),
            Err(e) => {
                warn!("Launcher for {} not regenerated: {}", instance.id, e);
                None
            }
        }
    }

    /// Put the launcher back the way the stored record `old` describes it
    fn rollback_shim(&self, old: &AppInstance, attempted: &AppInstance, app: &Application) {
        let result = if attempted.shim_path != old.shim_path {
            self.shims.remove(&attempted.shim_path)
        } else {
            self.write_shim(old, app)
        };
        if let Err(e) = result {
            warn!("Failed to roll back launcher {:?}: {}", attempted.shim_path, e);
        }
    }

    /// Copy an instance's settings into a new instance with its own data
    pub fn duplicate(&self, id: InstanceId, new_name: Option<&str>) -> Result<AppInstance> {
        let source = self.store.get(id)?;
        let name = new_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} Copy", source.name));
        let copy = self.create(&name, &source.target_app_path, source.options())?;
        info!("Duplicated instance {} as {}", id, copy.id);
        Ok(copy)
    }

    /// Apply user-editable fields from `edited` and regenerate the launcher.
    /// Name changes go through `rename`.
    pub fn update(&self, edited: &AppInstance) -> Result<AppInstance> {
        let stored = self.store.get(edited.id)?;
        let mut instance = stored.clone();
        instance.environment = edited.environment.clone();
        instance.arguments = edited.arguments.clone();
        instance.icon_path = edited.icon_path.clone();
        instance.isolation_override = edited.isolation_override;
        instance.erase_data_on_quit = edited.erase_data_on_quit;
        instance.show_in_quick_launch = edited.show_in_quick_launch;
        instance.notes = edited.notes.clone();
        instance.touch();

        self.prepare_container(&instance)?;
        let app = self.shim_target(&instance);
        if let Some(app) = &app {
            if let Err(e) = self.write_shim(&instance, app) {
                self.rollback_shim(&stored, &instance, app);
                return Err(e);
            }
        }
        if let Err(e) = self.store.update(instance.clone()) {
            if let Some(app) = &app {
                self.rollback_shim(&stored, &instance, app);
            }
            return Err(e);
        }

        if edited.name != instance.name {
            return self.rename(instance.id, &edited.name);
        }
        Ok(instance)
    }

    /// Delete an instance, stopping it first if it is running. The record goes
    /// first; launcher and data left behind by a failed cleanup are only logged.
    pub async fn delete(&self, id: InstanceId, delete_data: bool) -> Result<()> {
        let instance = self.store.get(id)?;

        if self.tracker.is_running(id) {
            self.stop_and_wait(id).await;
        }

        self.store.delete(id)?;
        if let Err(e) = self.shims.remove(&instance.shim_path) {
            warn!("Failed to remove launcher {:?}: {}", instance.shim_path, e);
        }
        if delete_data {
            if let Err(e) = self.containers.remove(&instance.data_path) {
                warn!("Failed to remove container {:?}: {}", instance.data_path, e);
            }
        }
        info!("Deleted instance {} (data removed: {})", id, delete_data);
        Ok(())
    }

    /// Terminate, then kill if the process outlives the grace period
    async fn stop_and_wait(&self, id: InstanceId) {
        let mut events = self.tracker.subscribe();
        self.tracker.terminate(id);
        if self.wait_for_exit(&mut events, id).await {
            return;
        }

        warn!("Instance {} did not quit in time, killing it", id);
        self.tracker.force_terminate(id);
        if !self.wait_for_exit(&mut events, id).await {
            warn!("Instance {} is still running", id);
        }
    }

    async fn wait_for_exit(
        &self,
        events: &mut broadcast::Receiver<ProcessEvent>,
        id: InstanceId,
    ) -> bool {
        if !self.tracker.is_running(id) {
            return true;
        }
        tokio::time::timeout(DELETE_GRACE, async {
            loop {
                match events.recv().await {
                    Ok(ProcessEvent::Terminated { instance_id, .. }) if instance_id == id => {
                        break
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !self.tracker.is_running(id) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
        .await
        .is_ok()
    }

    pub fn validate(&self, id: InstanceId) -> Result<ContainerValidation> {
        let instance = self.store.get(id)?;
        Ok(self.containers.validate(&instance.data_path))
    }

    pub fn repair(&self, id: InstanceId) -> Result<ContainerValidation> {
        let instance = self.store.get(id)?;
        let report = self
            .containers
            .repair(&instance.data_path, instance.target_app_type)?;
        self.prepare_container(&instance)?;
        Ok(report)
    }

    /// Wipe an instance's private data and rebuild an empty container
    pub fn reset_data(&self, id: InstanceId) -> Result<()> {
        if self.tracker.is_running(id) {
            return Err(InstanceError::InvalidInput(
                "Cannot reset data of a running instance".to_string(),
            ));
        }
        let instance = self.store.get(id)?;
        self.containers
            .reset(&instance.data_path, instance.target_app_type)?;
        self.prepare_container(&instance)?;
        info!("Reset data for instance {}", id);
        Ok(())
    }

    /// Show an instance's launcher (or its data, without one) in the file browser
    pub fn reveal(&self, id: InstanceId) -> Result<()> {
        let instance = self.store.get(id)?;
        let target = if instance.shim_path.exists() {
            &instance.shim_path
        } else {
            &instance.data_path
        };
        self.shims.reveal(target)
    }

    /// Export the given instances, or all of them when `ids` is empty
    pub fn export(&self, ids: &[InstanceId]) -> Result<ExportDocument> {
        let instances = self.store.load()?;
        let selected: Vec<&AppInstance> = instances
            .iter()
            .filter(|i| ids.is_empty() || ids.contains(&i.id))
            .collect();
        for id in ids {
            if !instances.iter().any(|i| i.id == *id) {
                return Err(InstanceError::NotFound(format!("Instance {} not found", id)));
            }
        }
        Ok(ExportDocument::new(selected))
    }

    /// Create instances from an export document. Entries whose target is
    /// missing or unusable are reported and skipped.
    pub fn import(&self, json: &str) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        for entry in parse_import(json)? {
            let result = Application::inspect(&entry.target_app_path).and_then(|app| {
                if app.bundle_id != entry.target_bundle_id {
                    warn!(
                        "Importing '{}': {:?} is {} rather than {}",
                        entry.name, entry.target_app_path, app.bundle_id, entry.target_bundle_id
                    );
                }
                self.create(&entry.name, &entry.target_app_path, entry.options())
            });

            match result {
                Ok(instance) => report.created.push(instance),
                Err(e) => {
                    error!("Failed to import '{}': {}", entry.name, e);
                    report.failed.push((entry.name.clone(), e.to_string()));
                }
            }
        }
        info!(
            "Imported {} instances ({} failed)",
            report.created.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// React to tracker events: instances flagged erase-on-quit get a fresh container
    pub fn handle_event(&self, event: &ProcessEvent) {
        let ProcessEvent::Terminated { instance_id, .. } = event else {
            return;
        };
        match self.store.get(*instance_id) {
            Ok(instance) if instance.erase_data_on_quit => {
                if let Err(e) = self.reset_data(instance.id) {
                    error!("Failed to erase data for {}: {}", instance.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Terminated instance {} has no record: {}", instance_id, e),
        }
    }
}
