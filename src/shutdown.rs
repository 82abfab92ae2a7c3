use tokio::sync::watch;

/// Signal d'arrêt partagé par toutes les tâches
pub type ShutdownSignal = watch::Receiver<bool>;

pub fn channel() -> (watch::Sender<bool>, ShutdownSignal) {
    watch::channel(false)
}

/// Se résout dès que l'arrêt est demandé (ou que l'émetteur a disparu)
pub async fn requested(signal: &mut ShutdownSignal) {
    let _ = signal.wait_for(|stop| *stop).await;
}
