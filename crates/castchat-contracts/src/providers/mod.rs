use anyhow::bail;

pub trait NamedProvider {
    fn name(&self) -> &str;
}

/// Providers addressable by name, in registration order.
#[derive(Debug, Clone)]
pub struct ProviderRegistry<T: NamedProvider> {
    providers: Vec<T>,
}

impl<T: NamedProvider> Default for ProviderRegistry<T> {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
        }
    }
}

impl<T: NamedProvider> ProviderRegistry<T> {
    pub fn new(providers: Vec<T>) -> Self {
        Self { providers }
    }

    /// Later registrations replace earlier ones with the same name.
    pub fn register(&mut self, provider: T) {
        self.providers
            .retain(|existing| existing.name() != provider.name());
        self.providers.push(provider);
    }

    /// Consumes the registry, keeping only the named provider.
    pub fn into_provider(self, name: &str) -> anyhow::Result<T> {
        let available = self.list().join(", ");
        let wanted = name.trim();
        match self
            .providers
            .into_iter()
            .find(|provider| provider.name().eq_ignore_ascii_case(wanted))
        {
            Some(provider) => Ok(provider),
            None => bail!("unknown provider '{wanted}' (available: {available})"),
        }
    }

    pub fn list(&self) -> Vec<String> {
        let mut names = self
            .providers
            .iter()
            .map(|provider| provider.name().to_string())
            .collect::<Vec<String>>();
        names.sort();
        names
    }
}
