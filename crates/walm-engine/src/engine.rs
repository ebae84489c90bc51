//! Template engine based on MiniJinja
//!
//! [`Engine::render_chart`] is the only entry point the release core uses.
//! It looks at the chart dialect once, prepares the values accordingly and
//! renders every template into one multi-document manifest.

use minijinja::Environment;
use serde::Serialize;
use tracing::debug;
use walm_core::chart::TEMPLATES_DIR;
use walm_core::plugin;
use walm_core::release::reserved;
use walm_core::{ChartDialect, ChartMetadata, LoadedChart, Values};

use crate::error::{EngineError, Result, TemplateError};
use crate::filters;
use crate::functions;

/// Release information exposed to templates as `release`
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseContext {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub is_install: bool,
    pub is_upgrade: bool,
    pub service: String,
}

impl ReleaseContext {
    pub fn new(name: &str, namespace: &str, is_upgrade: bool) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision: 0,
            is_install: !is_upgrade,
            is_upgrade,
            service: "Walm".to_string(),
        }
    }
}

/// Everything a render needs besides the chart itself
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub values: Values,
    pub release: ReleaseContext,
}

impl RenderContext {
    pub fn new(values: Values, release: ReleaseContext) -> Self {
        Self { values, release }
    }
}

/// Output of a chart render
#[derive(Debug, Clone, Default)]
pub struct RenderedChart {
    /// All rendered templates joined as one multi-document YAML string
    pub manifest: String,

    /// Rendered `NOTES.txt`, if the chart has one
    pub notes: Option<String>,
}

/// Template engine builder
pub struct EngineBuilder {
    strict_mode: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self { strict_mode: true }
    }

    /// Set strict mode (fail on undefined variables)
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(self.strict_mode)
    }
}

/// The template engine
#[derive(Debug, Clone)]
pub struct Engine {
    strict_mode: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Engine {
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn create_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();

        if self.strict_mode {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        } else {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Chainable);
        }

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("indent", filters::indent);
        env.add_filter("required", filters::required);
        env.add_filter("sha256", filters::sha256sum);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("trimsuffix", filters::trimsuffix);

        env.add_function("fail", functions::fail);
        env.add_function("dict", functions::dict);
        env.add_function("list", functions::list);
        env.add_function("get", functions::get);
        env.add_function("coalesce", functions::coalesce);
        env.add_function("ternary", functions::ternary);
        env.add_function("tostring", functions::tostring);
        env.add_function("toint", functions::toint);

        env
    }

    /// Render a single template string
    pub fn render_string(
        &self,
        template: &str,
        values: &Values,
        release: &ReleaseContext,
        template_name: &str,
    ) -> Result<String> {
        let mut env = self.create_environment();
        env.add_template_owned(template_name.to_string(), template.to_string())
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;
        let tmpl = env
            .get_template(template_name)
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        let ctx = minijinja::context! {
            values => values.inner(),
            release => release,
        };
        tmpl.render(ctx)
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template).into())
    }

    /// Render every template of a chart
    ///
    /// Legacy (v1) charts read a handful of reserved keys from their values;
    /// those are injected here so callers never branch on the dialect.
    pub fn render_chart(&self, chart: &LoadedChart, context: &RenderContext) -> Result<RenderedChart> {
        let values = match chart.dialect() {
            ChartDialect::V1 => legacy_values(&context.values, &context.release, &chart.metadata)?,
            ChartDialect::V2 => context.values.clone(),
        };
        self.render_templates(chart, &values, &context.release)
    }

    fn render_templates(
        &self,
        chart: &LoadedChart,
        values: &Values,
        release: &ReleaseContext,
    ) -> Result<RenderedChart> {
        let mut env = self.create_environment();

        for (path, content) in &chart.templates {
            let name = template_name(path);
            env.add_template_owned(name.to_string(), content.clone())
                .map_err(|e| TemplateError::from_minijinja(e, name, content))?;
        }

        let ctx = minijinja::context! {
            values => values.inner(),
            release => release,
            chart => &chart.metadata,
        };

        let mut documents = Vec::new();
        let mut notes = None;

        // BTreeMap iteration keeps the output order stable across renders
        for (path, content) in &chart.templates {
            let name = template_name(path);
            let file_name = name.rsplit('/').next().unwrap_or(name);
            if file_name.starts_with('_') {
                continue;
            }

            let tmpl = env
                .get_template(name)
                .map_err(|e| TemplateError::from_minijinja(e, name, content))?;
            let rendered = tmpl
                .render(&ctx)
                .map_err(|e| TemplateError::from_minijinja(e, name, content))?;

            if file_name.eq_ignore_ascii_case("NOTES.txt") {
                notes = Some(rendered);
                continue;
            }

            let trimmed = rendered.trim();
            if trimmed.is_empty() || trimmed == "---" {
                debug!(template = %name, "template rendered empty, skipped");
                continue;
            }
            documents.push(format!(
                "---\n# Source: {}/{}{}\n{}\n",
                chart.metadata.name,
                TEMPLATES_DIR,
                name,
                rendered.trim_start_matches("---").trim_matches('\n')
            ));
        }

        Ok(RenderedChart {
            manifest: documents.concat(),
            notes,
        })
    }
}

fn template_name(path: &str) -> &str {
    path.strip_prefix(TEMPLATES_DIR).unwrap_or(path)
}

/// Values as a legacy chart expects them
fn legacy_values(values: &Values, release: &ReleaseContext, chart: &ChartMetadata) -> Result<Values> {
    let plugins = plugin::extract_plugins(values).map_err(EngineError::Chart)?;

    let mut values = values.clone();
    values.insert(reserved::INSTALL_NAMESPACE, release.namespace.clone().into());
    values.insert(reserved::HELM_RELEASE_NAME, release.name.clone().into());
    values.insert(reserved::HELM_RELEASE_NAMESPACE, release.namespace.clone().into());
    values.insert(reserved::CHART_VERSION, chart.version.clone().into());
    values.insert(reserved::CHART_NAME, chart.name.clone().into());
    values.insert(reserved::CHART_APP_VERSION, chart.app_version.clone().into());
    values.insert(reserved::APPLICATION_PAUSE, plugin::is_paused(&plugins).into());
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use walm_core::ChartFile;
    use walm_core::dependency::LEGACY_APP_PATH;
    use walm_core::plugin::ReleasePlugin;

    fn chart(extra: Vec<ChartFile>) -> LoadedChart {
        let mut files = vec![
            ChartFile::new("Chart.yaml", "name: demo\nversion: 1.2.0\nappVersion: \"6.0\"\n"),
            ChartFile::new("values.yaml", "replicas: 3\n"),
            ChartFile::new(
                "templates/deploy.yaml",
                "kind: Deployment\nmetadata:\n  name: {{ release.name }}\nspec:\n  replicas: {{ values.replicas }}\n",
            ),
            ChartFile::new("templates/_helpers.tpl", "{% macro name() %}demo{% endmacro %}"),
            ChartFile::new("templates/empty.yaml", "{% if false %}kind: Secret{% endif %}"),
            ChartFile::new("templates/NOTES.txt", "installed {{ release.name }}"),
        ];
        files.extend(extra);
        LoadedChart::from_files(files).unwrap()
    }

    fn context(chart: &LoadedChart) -> RenderContext {
        RenderContext::new(
            chart.default_values.clone(),
            ReleaseContext::new("web", "ns", false),
        )
    }

    #[test]
    fn test_render_string() {
        let engine = Engine::new(true);
        let values = Values::from_yaml("image:\n  tag: \"1.25\"\n").unwrap();
        let release = ReleaseContext::new("web", "ns", false);
        let out = engine
            .render_string("tag: {{ values.image.tag | quote }}", &values, &release, "t.yaml")
            .unwrap();
        assert_eq!(out, "tag: \"1.25\"");
    }

    #[test]
    fn test_render_chart_skips_helpers_and_notes() {
        let chart = chart(vec![]);
        let rendered = Engine::new(true).render_chart(&chart, &context(&chart)).unwrap();

        assert!(rendered.manifest.starts_with("---\n# Source: demo/templates/deploy.yaml\n"));
        assert!(rendered.manifest.contains("replicas: 3"));
        assert!(!rendered.manifest.contains("empty.yaml"));
        assert!(!rendered.manifest.contains("macro"));
        assert_eq!(rendered.notes.as_deref(), Some("installed web"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let chart = chart(vec![ChartFile::new("templates/a.yaml", "kind: Service\n")]);
        let engine = Engine::new(true);
        let first = engine.render_chart(&chart, &context(&chart)).unwrap();
        let second = engine.render_chart(&chart, &context(&chart)).unwrap();
        assert_eq!(first.manifest, second.manifest);
        assert!(first.manifest.find("a.yaml").unwrap() < first.manifest.find("deploy.yaml").unwrap());
    }

    #[test]
    fn test_legacy_chart_gets_reserved_keys() {
        let mut chart = chart(vec![ChartFile::new(LEGACY_APP_PATH, "name: demo\n")]);
        chart.add_template(
            "legacy.yaml",
            "ns: {{ values.Transwarp_Install_Namespace }}\npause: {{ values.Transwarp_Application_Pause }}\nchart: {{ values.chartName }}-{{ values.chartVersion }}\n".to_string(),
        );
        assert_eq!(chart.dialect(), ChartDialect::V1);

        let mut ctx = context(&chart);
        plugin::embed_plugins(&mut ctx.values, &[ReleasePlugin::new("PauseRelease")]).unwrap();
        let rendered = Engine::new(true).render_chart(&chart, &ctx).unwrap();
        assert!(rendered.manifest.contains("ns: ns"));
        assert!(rendered.manifest.contains("pause: true"));
        assert!(rendered.manifest.contains("chart: demo-1.2.0"));
    }

    #[test]
    fn test_v2_chart_has_no_reserved_keys() {
        let mut chart = chart(vec![]);
        chart.add_template("v2.yaml", "ns: {{ values.Transwarp_Install_Namespace }}\n".to_string());
        let err = Engine::new(true).render_chart(&chart, &context(&chart)).unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
    }

    #[test]
    fn test_lenient_mode_renders_missing_values_empty() {
        let mut chart = chart(vec![]);
        chart.add_template("opt.yaml", "kind: ConfigMap\nx: \"{{ values.missing.deep }}\"\n".to_string());
        let rendered = Engine::builder()
            .strict(false)
            .build()
            .render_chart(&chart, &context(&chart))
            .unwrap();
        assert!(rendered.manifest.contains("x: \"\""));
    }
}
