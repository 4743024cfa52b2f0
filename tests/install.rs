use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use kuns_installer::{
    feedback::{channel::ChannelFeedback, devnull::DevNull, InstallEvent},
    CommandRunner, Feedback, InstallCommand, InstallOptions, InstallPlan, InstallSettings,
    RunOutcome, StageKind, Strictness,
};
use tempfile::TempDir;
use tokio::sync::{mpsc::UnboundedReceiver, Notify};

const FSTAB: &str = "UUID=1111-2222 / ext4 rw,relatime 0 1\n";
const ROOT_UUID: &str = "0b5c0a9e-2f5e-4d3f-9c39-6b1b7f0e2d44";

/// Records every command and answers like a healthy live system would
#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<InstallCommand>>,
    failing: Option<fn(&InstallCommand) -> bool>,
    blocking: Option<(fn(&InstallCommand) -> bool, Arc<Notify>)>,
}

impl Recorder {
    fn failing(predicate: fn(&InstallCommand) -> bool) -> Self {
        Self {
            failing: Some(predicate),
            ..Default::default()
        }
    }

    fn commands(&self) -> Vec<InstallCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn rendered(&self) -> Vec<String> {
        self.commands().iter().map(ToString::to_string).collect()
    }

    async fn record(&self, command: &InstallCommand) -> bool {
        self.commands.lock().unwrap().push(command.clone());
        if let Some((predicate, started)) = &self.blocking {
            if predicate(command) {
                started.notify_one();
                std::future::pending::<()>().await;
            }
        }
        !self.failing.is_some_and(|predicate| predicate(command))
    }
}

#[async_trait::async_trait]
impl CommandRunner for Recorder {
    async fn run(
        &self,
        command: &InstallCommand,
        strictness: Strictness,
        feedback: &dyn Feedback,
    ) -> bool {
        feedback.log(&format!("Executing: {command}"));
        let succeeded = self.record(command).await;
        succeeded || strictness == Strictness::BestEffort
    }

    async fn capture(&self, command: &InstallCommand, feedback: &dyn Feedback) -> Option<String> {
        feedback.log(&format!("Executing: {command}"));
        if !self.record(command).await {
            return None;
        }
        match command.program() {
            "genfstab" => Some(FSTAB.to_string()),
            "blkid" => Some(format!("{ROOT_UUID}\n")),
            _ => Some(String::new()),
        }
    }
}

/// A fake disk with its partition nodes and a freshly bootstrapped target root
struct Target {
    dir: TempDir,
}

impl Target {
    async fn new() -> eyre::Result<Self> {
        let target = Self {
            dir: tempfile::tempdir()?,
        };
        for node in ["sda", "sda1", "sda2"] {
            tokio::fs::write(target.dir.path().join(node), "").await?;
        }
        let etc = target.root().join("etc");
        tokio::fs::create_dir_all(&etc).await?;
        tokio::fs::write(
            etc.join("locale.gen"),
            "#  en_US ISO-8859-1\n#de_DE.UTF-8 UTF-8\n#en_US.UTF-8 UTF-8\n",
        )
        .await?;
        tokio::fs::write(
            etc.join("sudoers"),
            "root ALL=(ALL:ALL) ALL\n# %wheel ALL=(ALL:ALL) ALL\n# %wheel ALL=(ALL:ALL) NOPASSWD: ALL\n",
        )
        .await?;
        Ok(target)
    }

    fn disk(&self) -> PathBuf {
        self.dir.path().join("sda")
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("mnt")
    }

    fn settings(&self) -> InstallSettings {
        let mut settings = InstallSettings::new(self.disk());
        settings
            .hostname("kuns-test")
            .username("alice")
            .password("hunter2")
            .root_password("hunter3")
            .timezone("Europe/Berlin")
            .locale("de_DE.UTF-8");
        settings
    }

    fn plan(&self, settings: InstallSettings) -> InstallPlan {
        let mut options = InstallOptions::default();
        options
            .mount_point(self.root())
            .settle_timeout(std::time::Duration::ZERO);
        InstallPlan::new(settings, options)
    }
}

fn drain(mut receiver: UnboundedReceiver<InstallEvent>) -> Vec<InstallEvent> {
    let mut events = vec![];
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

fn progress(events: &[InstallEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            InstallEvent::Progress { percent } => Some(*percent),
            _ => None,
        })
        .collect()
}

fn finished(events: &[InstallEvent]) -> Vec<(bool, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            InstallEvent::Finished { success, message } => Some((*success, message.clone())),
            _ => None,
        })
        .collect()
}

fn chrooted<'a>(commands: &'a [InstallCommand], program: &str) -> Vec<&'a InstallCommand> {
    commands
        .iter()
        .filter(|command| command.chrooted_program() == Some(program))
        .collect()
}

#[tokio::test]
async fn successful_install() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::default();
    let (feedback, receiver) = ChannelFeedback::new();

    let outcome = target
        .plan(target.settings())
        .install(&runner, &feedback, None)
        .await;
    assert_eq!(
        outcome,
        RunOutcome::Success {
            message: "Kuns OS installation completed successfully!".into()
        }
    );

    let events = drain(receiver);
    assert_eq!(progress(&events), [0, 15, 25, 35, 60, 65, 85, 95, 100]);
    assert_eq!(
        finished(&events),
        [(true, "Kuns OS installation completed successfully!".to_string())]
    );
    assert!(events.contains(&InstallEvent::Status {
        text: "Installing base system...".into()
    }));

    let disk = target.disk().display().to_string();
    let rendered = runner.rendered();
    assert_eq!(
        &rendered[..6],
        [
            format!("umount -R {}", target.root().display()),
            format!("parted -s {disk} mklabel gpt"),
            format!("parted -s {disk} mkpart primary fat32 1MiB 513MiB"),
            format!("parted -s {disk} set 1 esp on"),
            format!("parted -s {disk} mkpart primary ext4 513MiB 100%"),
            format!("partprobe {disk}"),
        ]
    );
    assert!(rendered.contains(&format!("mkfs.fat -F32 {disk}1")));
    assert!(rendered.contains(&format!("mkfs.ext4 -F {disk}2")));

    let root = target.root();
    assert_eq!(tokio::fs::read_to_string(root.join("etc/fstab")).await?, FSTAB);
    assert_eq!(
        tokio::fs::read_to_string(root.join("etc/hostname")).await?,
        "kuns-test\n"
    );
    assert_eq!(
        tokio::fs::read_to_string(root.join("etc/locale.conf")).await?,
        "LANG=de_DE.UTF-8\n"
    );
    assert_eq!(
        tokio::fs::read_to_string(root.join("etc/locale.gen")).await?,
        "#  en_US ISO-8859-1\nde_DE.UTF-8 UTF-8\nen_US.UTF-8 UTF-8\n"
    );
    assert_eq!(
        tokio::fs::read_to_string(root.join("etc/sudoers")).await?,
        "root ALL=(ALL:ALL) ALL\n%wheel ALL=(ALL:ALL) ALL\n# %wheel ALL=(ALL:ALL) NOPASSWD: ALL\n"
    );
    let standalone =
        tokio::fs::read_to_string(root.join("boot/grub/grub-standalone.cfg")).await?;
    assert!(standalone.contains(&format!("root=UUID={ROOT_UUID}")));

    // Every stage ran, the last command is the recursive unmount of Cleanup
    assert_eq!(
        rendered.last(),
        Some(&format!("umount -R {}", root.display()))
    );
    Ok(())
}

#[tokio::test]
async fn commands_are_ordered_by_stage() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::default();
    let outcome = target
        .plan(target.settings())
        .install(&runner, &DevNull, None)
        .await;
    assert!(outcome.is_success());

    let rendered = runner.rendered();
    let position = |needle: &str| {
        rendered
            .iter()
            .position(|command| command.contains(needle))
            .unwrap_or_else(|| panic!("`{needle}` was never run: {rendered:#?}"))
    };
    let root = target.root();
    let disk = target.disk().display().to_string();
    let order = [
        "mklabel gpt".to_string(),
        "mkfs.fat".to_string(),
        "mkfs.ext4".to_string(),
        format!("mount {disk}2 {}", root.display()),
        format!("mount {disk}1 {}", root.join("boot").display()),
        "pacstrap".to_string(),
        "genfstab".to_string(),
        "locale-gen".to_string(),
        "useradd".to_string(),
        "systemctl enable lightdm".to_string(),
        "grub-install --target=x86_64-efi".to_string(),
        "grub-mkconfig".to_string(),
        "blkid".to_string(),
        "legacy_boot".to_string(),
    ];
    let positions = order.iter().map(|v| position(v)).collect::<Vec<_>>();
    let mut sorted = positions.clone();
    sorted.sort();
    assert_eq!(positions, sorted, "{rendered:#?}");
    Ok(())
}

#[tokio::test]
async fn missing_disk_runs_nothing() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::default();
    let (feedback, receiver) = ChannelFeedback::new();

    let mut settings = target.settings();
    settings.disk(target.dir.path().join("sdz"));
    let outcome = target.plan(settings).install(&runner, &feedback, None).await;

    assert_eq!(outcome.failed_stage(), Some(StageKind::DiskPrep));
    assert!(outcome.message().starts_with("Disk preparation failed"));
    assert!(runner.commands().is_empty());

    let events = drain(receiver);
    assert_eq!(progress(&events), [0]);
    assert_eq!(finished(&events).len(), 1);
    assert!(events.contains(&InstallEvent::Log {
        line: format!("Disk {} does not exist", target.dir.path().join("sdz").display())
    }));
    Ok(())
}

#[tokio::test]
async fn bootloader_continues_when_both_grub_installs_fail() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::failing(|command| command.chrooted_program() == Some("grub-install"));
    let (feedback, receiver) = ChannelFeedback::new();

    let outcome = target
        .plan(target.settings())
        .install(&runner, &feedback, None)
        .await;
    assert!(outcome.is_success());

    let commands = runner.commands();
    assert_eq!(chrooted(&commands, "grub-install").len(), 2);
    assert_eq!(chrooted(&commands, "grub-mkconfig").len(), 1);
    assert!(drain(receiver).contains(&InstallEvent::Log {
        line: "WARNING: Both EFI and BIOS installation failed!".into()
    }));
    Ok(())
}

#[tokio::test]
async fn failed_grub_config_fails_bootloader_stage() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::failing(|command| command.chrooted_program() == Some("grub-mkconfig"));
    let (feedback, receiver) = ChannelFeedback::new();

    let outcome = target
        .plan(target.settings())
        .install(&runner, &feedback, None)
        .await;
    assert_eq!(outcome.failed_stage(), Some(StageKind::Bootloader));
    assert!(outcome
        .message()
        .starts_with("Bootloader installation failed"));

    let events = drain(receiver);
    assert_eq!(progress(&events), [0, 15, 25, 35, 60, 65, 85]);
    assert_eq!(finished(&events), [(false, outcome.message().to_string())]);
    Ok(())
}

#[tokio::test]
async fn empty_root_password_skips_root_account() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::default();

    let mut settings = target.settings();
    settings.root_password("");
    let outcome = target.plan(settings).install(&runner, &DevNull, None).await;
    assert!(outcome.is_success());

    let commands = runner.commands();
    let chpasswd = chrooted(&commands, "chpasswd");
    assert_eq!(chpasswd.len(), 1);
    assert_eq!(chpasswd[0].get_stdin(), Some("alice:hunter2\n"));
    assert!(!commands
        .iter()
        .any(|command| command.to_string().contains("hunter2")));
    Ok(())
}

#[tokio::test]
async fn empty_password_skips_user_creation() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::default();

    let mut settings = target.settings();
    settings.password("");
    let outcome = target.plan(settings).install(&runner, &DevNull, None).await;
    assert!(outcome.is_success());

    let commands = runner.commands();
    assert!(chrooted(&commands, "useradd").is_empty());
    let chpasswd = chrooted(&commands, "chpasswd");
    assert_eq!(chpasswd.len(), 1);
    assert_eq!(chpasswd[0].get_stdin(), Some("root:hunter3\n"));
    Ok(())
}

#[tokio::test]
async fn selected_packages_are_deduplicated() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::default();

    let mut settings = target.settings();
    settings.packages(["firefox", "htop", "htop"]);
    let outcome = target.plan(settings).install(&runner, &DevNull, None).await;
    assert!(outcome.is_success());

    let commands = runner.commands();
    let pacstrap = commands
        .iter()
        .find(|command| command.program() == "pacstrap")
        .ok_or_else(|| eyre::eyre!("pacstrap never ran"))?;
    let args = pacstrap.get_args();
    assert_eq!(args[0], target.root().display().to_string());
    for package in ["base", "linux", "grub", "lightdm", "firefox", "htop"] {
        assert_eq!(
            args.iter().filter(|arg| *arg == package).count(),
            1,
            "{package} in {args:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn failure_after_mount_unmounts_target() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::failing(|command| command.program() == "pacstrap");

    let outcome = target
        .plan(target.settings())
        .install(&runner, &DevNull, None)
        .await;
    assert_eq!(outcome.failed_stage(), Some(StageKind::BaseInstall));

    let rendered = runner.rendered();
    assert_eq!(
        rendered.last(),
        Some(&format!("umount -R {}", target.root().display()))
    );
    assert!(!rendered.iter().any(|command| command.starts_with("genfstab")));
    Ok(())
}

#[tokio::test]
async fn failure_before_mount_runs_no_cleanup() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::failing(|command| command.program() == "mkfs.ext4");

    let outcome = target
        .plan(target.settings())
        .install(&runner, &DevNull, None)
        .await;
    assert_eq!(outcome.failed_stage(), Some(StageKind::Filesystems));
    assert_eq!(
        runner.rendered().last(),
        Some(&format!("mkfs.ext4 -F {}2", target.disk().display()))
    );
    Ok(())
}

#[tokio::test]
async fn cleanup_on_failure_can_be_disabled() -> eyre::Result<()> {
    let target = Target::new().await?;
    let runner = Recorder::failing(|command| command.program() == "genfstab");

    let mut options = InstallOptions::default();
    options
        .mount_point(target.root())
        .settle_timeout(std::time::Duration::ZERO)
        .cleanup_on_failure(false);
    let outcome = InstallPlan::new(target.settings(), options)
        .install(&runner, &DevNull, None)
        .await;
    assert_eq!(outcome.failed_stage(), Some(StageKind::Fstab));
    assert_eq!(
        runner.rendered().last(),
        Some(&format!("genfstab -U {}", target.root().display()))
    );
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_the_running_stage() -> eyre::Result<()> {
    let target = Target::new().await?;
    let started = Arc::new(Notify::new());
    let runner = Arc::new(Recorder {
        blocking: Some((|command| command.program() == "pacstrap", started.clone())),
        ..Default::default()
    });
    let (feedback, receiver) = ChannelFeedback::new();

    let handle = target
        .plan(target.settings())
        .spawn(runner.clone(), Arc::new(feedback));
    started.notified().await;
    handle.cancel();
    let outcome = handle.wait().await;

    assert_eq!(
        outcome,
        RunOutcome::Failure {
            stage: Some(StageKind::BaseInstall),
            message: "Installation cancelled by user".into(),
        }
    );
    let rendered = runner.rendered();
    assert_eq!(
        rendered.last(),
        Some(&format!("umount -R {}", target.root().display()))
    );

    let events = drain(receiver);
    assert_eq!(progress(&events), [0, 15, 25, 35]);
    assert_eq!(
        finished(&events),
        [(false, "Installation cancelled by user".to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn panicking_worker_reports_failure() -> eyre::Result<()> {
    struct Exploding;

    #[async_trait::async_trait]
    impl CommandRunner for Exploding {
        async fn run(&self, _: &InstallCommand, _: Strictness, _: &dyn Feedback) -> bool {
            panic!("runner exploded")
        }

        async fn capture(&self, _: &InstallCommand, _: &dyn Feedback) -> Option<String> {
            panic!("runner exploded")
        }
    }

    let target = Target::new().await?;
    let (feedback, receiver) = ChannelFeedback::new();
    let outcome = target
        .plan(target.settings())
        .spawn(Arc::new(Exploding), Arc::new(feedback))
        .wait()
        .await;

    assert_eq!(outcome.failed_stage(), None);
    assert!(outcome.message().starts_with("Installation error:"));
    let events = drain(receiver);
    assert_eq!(finished(&events).len(), 1);
    assert!(!finished(&events)[0].0);
    Ok(())
}

#[tokio::test]
async fn completed_stages_are_skipped_on_rerun() -> eyre::Result<()> {
    let target = Target::new().await?;
    let mut plan = target.plan(target.settings());

    let runner = Recorder::failing(|command| command.program() == "genfstab");
    let outcome = plan.install(&runner, &DevNull, None).await;
    assert_eq!(outcome.failed_stage(), Some(StageKind::Fstab));

    // The failed run unmounted the target, the rerun mounts it again before resuming
    let runner = Recorder::default();
    let outcome = plan.install(&runner, &DevNull, None).await;
    assert!(outcome.is_success(), "{outcome:?}");
    let rendered = runner.rendered();
    let disk = target.disk().display().to_string();
    let root = target.root().display().to_string();
    assert_eq!(
        rendered[..3].to_vec(),
        vec![
            format!("mount {disk}2 {root}"),
            format!("mount {disk}1 {root}/boot"),
            format!("genfstab -U {root}"),
        ],
        "{rendered:#?}"
    );
    assert!(!rendered.iter().any(|command| command.contains("mklabel")));
    assert!(!rendered.iter().any(|command| command.starts_with("pacstrap")));
    Ok(())
}

#[tokio::test]
async fn rerun_without_cleanup_keeps_the_mounts() -> eyre::Result<()> {
    let target = Target::new().await?;
    let mut options = InstallOptions::default();
    options
        .mount_point(target.root())
        .settle_timeout(std::time::Duration::ZERO)
        .cleanup_on_failure(false);
    let mut plan = InstallPlan::new(target.settings(), options);

    let runner = Recorder::failing(|command| command.program() == "genfstab");
    let outcome = plan.install(&runner, &DevNull, None).await;
    assert_eq!(outcome.failed_stage(), Some(StageKind::Fstab));

    let runner = Recorder::default();
    let outcome = plan.install(&runner, &DevNull, None).await;
    assert!(outcome.is_success(), "{outcome:?}");
    let rendered = runner.rendered();
    assert!(rendered[0].starts_with("genfstab"), "{rendered:#?}");
    Ok(())
}

#[tokio::test]
async fn sudoers_keeps_its_mode() -> eyre::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let target = Target::new().await?;
    let sudoers = target.root().join("etc/sudoers");
    tokio::fs::set_permissions(&sudoers, std::fs::Permissions::from_mode(0o440)).await?;

    let runner = Recorder::default();
    let outcome = target
        .plan(target.settings())
        .install(&runner, &DevNull, None)
        .await;
    assert!(outcome.is_success(), "{outcome:?}");

    let body = tokio::fs::read_to_string(&sudoers).await?;
    assert!(body.contains("\n%wheel ALL=(ALL:ALL) ALL\n"), "{body}");
    let mode = tokio::fs::metadata(&sudoers).await?.permissions().mode();
    assert_eq!(mode & 0o777, 0o440);
    Ok(())
}

#[test]
fn partition_naming() {
    assert_eq!(
        kuns_installer::PartitionLayout::for_disk("/dev/nvme0n1").root_partition,
        Path::new("/dev/nvme0n1p2")
    );
}
